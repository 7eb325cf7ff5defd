//! Agent-side coordinator: registry of backend sessions.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::driver::{AgentRequest, SessionTask};
use super::session::AgentSession;
use crate::bridge::{AgentBridge, Connected};
use crate::config::AgentConfig;
use crate::error::{RelayError, Result};
use crate::framing::{Descriptor, Detach};
use crate::stats::RelayStats;

/// Depth of each session's mailbox
const MAILBOX: usize = 8;

/// Opens backend transports.
pub trait Connector: Send + Sync + 'static {
    /// Stream produced by [`Connector::connect`]
    type Stream: Detach;

    /// Open a transport to `addr`.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Self::Stream>>;
}

/// Plain TCP to the backend
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<TcpStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// Mailbox of a live session task
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    requests: mpsc::Sender<AgentRequest>,
}

/// Shared session registry; session tasks remove themselves on exit
pub(crate) type Registry = Arc<RwLock<HashMap<String, SessionHandle>>>;

/// Owns every agent-side session.
///
/// Sessions run on their own tasks; the coordinator only keeps their
/// mailboxes. A session leaves the registry when it reaches `Disconnected`
/// or `Fatal`, and is never retried.
pub struct AgentCoordinator<C: Connector = TcpConnector> {
    /// Agent configuration
    config: AgentConfig,
    /// Backend address from `host` and the descriptor port
    addr: SocketAddr,
    /// Descriptor parsed at bootstrap
    descriptor: Descriptor,
    /// Transport factory
    connector: Arc<C>,
    /// Live sessions by ID
    sessions: Registry,
    /// Counters
    stats: Arc<RelayStats>,
}

impl AgentCoordinator<TcpConnector> {
    /// Load the descriptor named in `config` and connect over TCP.
    pub fn bootstrap(config: AgentConfig) -> Result<Self> {
        let descriptor = Descriptor::load(&config.descriptor_path)?;
        Self::with_connector(config, descriptor, TcpConnector)
    }
}

impl<C: Connector> AgentCoordinator<C> {
    /// Build a coordinator from an already parsed descriptor.
    pub fn with_connector(config: AgentConfig, descriptor: Descriptor, connector: C) -> Result<Self> {
        let ip: IpAddr = match config.host.as_str() {
            "localhost" => IpAddr::from([127, 0, 0, 1]),
            host => host
                .parse()
                .map_err(|e| RelayError::Config(format!("invalid agent host {host:?}: {e}")))?,
        };
        let addr = SocketAddr::new(ip, descriptor.port);

        tracing::info!(%addr, max_sessions = config.max_sessions, "agent coordinator ready");

        Ok(Self {
            config,
            addr,
            descriptor,
            connector: Arc::new(connector),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RelayStats::new()),
        })
    }

    /// Backend address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Counters shared with the session tasks
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Number of tracked sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// IDs of tracked sessions
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Open a backend session and wait for its greeting.
    ///
    /// Fails with `CapacityExceeded` at `max_sessions`, or `SessionExists`
    /// when `session_id` is already tracked.
    pub async fn connect(&self, session_id: Option<String>) -> Result<Connected> {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(MAILBOX);

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                return Err(RelayError::SessionExists(id));
            }
            if sessions.len() >= self.config.max_sessions {
                self.stats.record_rejected();
                tracing::warn!(limit = self.config.max_sessions, "agent session refused at capacity");
                return Err(RelayError::CapacityExceeded {
                    limit: self.config.max_sessions,
                });
            }
            sessions.insert(id.clone(), SessionHandle { requests: tx });
        }

        let task = SessionTask::new(
            AgentSession::new(id.clone(), self.config.max_response_bytes),
            Arc::clone(&self.connector),
            self.addr,
            self.descriptor.nonce.clone(),
            self.config.connect_timeout(),
            self.config.greeting_timeout(),
            rx,
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(task.run(ready_tx));

        let greeting = ready_rx.await.map_err(|_| {
            RelayError::Transport("session task ended during the handshake".to_string())
        })??;

        Ok(Connected {
            session_id: id,
            greeting,
        })
    }

    /// Send one command block and wait for the complete response.
    pub async fn send(&self, session_id: &str, block: Bytes) -> Result<Bytes> {
        let handle = self.handle(session_id).await?;
        let (reply, rx) = oneshot::channel();
        handle
            .requests
            .send(AgentRequest::Send { block, reply })
            .await
            .map_err(|_| RelayError::SessionNotFound(session_id.to_string()))?;

        rx.await.map_err(|_| {
            RelayError::Transport("session ended before the response arrived".to_string())
        })?
    }

    /// Tear a session down and wait for the outcome.
    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        Self::request_disconnect(session_id, handle).await
    }

    /// Tear every session down.
    ///
    /// Each session is waited on until it resolves either way, so a session
    /// whose cleanup fails (`Fatal`) does not hold up the rest.
    pub async fn stop(&self) {
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        tracing::info!(sessions = handles.len(), "stopping agent coordinator");

        let waits = handles.into_iter().map(|(id, handle)| async move {
            match Self::request_disconnect(&id, handle).await {
                Ok(()) => tracing::debug!(session = %id, "session stopped"),
                Err(RelayError::SessionNotFound(_)) => {},
                Err(e) => tracing::warn!(session = %id, error = %e, "session stopped with error"),
            }
        });
        join_all(waits).await;
    }

    async fn handle(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }

    async fn request_disconnect(session_id: &str, handle: SessionHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if handle
            .requests
            .send(AgentRequest::Disconnect { reply })
            .await
            .is_err()
        {
            return Err(RelayError::SessionNotFound(session_id.to_string()));
        }

        // A dropped reply means the task already went through teardown.
        rx.await.unwrap_or(Ok(()))
    }
}

impl<C: Connector> AgentBridge for AgentCoordinator<C> {
    fn connect(&self, session_id: Option<String>) -> BoxFuture<'_, Result<Connected>> {
        Box::pin(AgentCoordinator::connect(self, session_id))
    }

    fn send(&self, session_id: String, block: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move { AgentCoordinator::send(self, &session_id, block).await })
    }

    fn disconnect(&self, session_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { AgentCoordinator::disconnect(self, &session_id).await })
    }
}
