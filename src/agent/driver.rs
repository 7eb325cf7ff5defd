//! Per-session task driving one backend connection.
//!
//! The task owns the [`AgentSession`] and its transport. Callers talk to it
//! through a mailbox; every await inside the task also services that
//! mailbox, so a disconnect is honoured even while a command is waiting on
//! the backend.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::coordinator::{Connector, Registry};
use super::session::{AgentResponse, AgentSession};
use crate::error::{RelayError, Result};
use crate::framing::{cleanup_transport, sanitize, Detach, Link, Nonce, ResponseKind};
use crate::stats::RelayStats;

/// Read buffer size for backend chunks
const READ_CHUNK: usize = 8 * 1024;

/// Message to a session task
#[derive(Debug)]
pub(crate) enum AgentRequest {
    /// Send one command block
    Send {
        block: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    /// Tear the session down
    Disconnect { reply: oneshot::Sender<Result<()>> },
}

/// Why the session is leaving service
#[derive(Debug)]
enum Exit {
    /// A caller asked for it
    Disconnect(oneshot::Sender<Result<()>>),
    /// The backend closed the transport cleanly
    Closed,
    /// Every handle to the mailbox is gone
    Orphaned,
    /// Something failed
    Failed(RelayError),
}

impl From<RelayError> for Exit {
    fn from(err: RelayError) -> Self {
        Exit::Failed(err)
    }
}

impl Exit {
    /// Error handed to a call that was pending when the session left.
    fn pending_error(&self) -> RelayError {
        match self {
            Exit::Failed(e) => e.clone(),
            _ => RelayError::Transport("session closed while a command was in flight".to_string()),
        }
    }
}

/// Run `fut` while answering the mailbox.
///
/// A second `Send` is refused with a protocol violation, since the session
/// is already busy; a `Disconnect` or a closed mailbox interrupts `fut`.
async fn guard<F: Future>(
    fut: F,
    requests: &mut mpsc::Receiver<AgentRequest>,
) -> std::result::Result<F::Output, Exit> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            request = requests.recv() => match request {
                Some(AgentRequest::Send { block, reply }) => {
                    tracing::warn!(command = %sanitize(&block), "command refused, another is in flight");
                    let _ = reply.send(Err(RelayError::ProtocolViolation(
                        "a command is already in flight".to_string(),
                    )));
                },
                Some(AgentRequest::Disconnect { reply }) => return Err(Exit::Disconnect(reply)),
                None => return Err(Exit::Orphaned),
            },
        }
    }
}

/// Read chunks until `session` reports a complete response.
async fn read_response<S: Detach>(
    link: &mut Link<S>,
    session: &mut AgentSession,
    buf: &mut [u8],
) -> Result<AgentResponse> {
    loop {
        let n = link
            .read(buf)
            .await
            .map_err(|e| RelayError::Transport(format!("read from agent: {e}")))?;
        if n == 0 {
            return Err(RelayError::Transport(
                "agent closed the connection before the response completed".to_string(),
            ));
        }
        if let Some(response) = session.push_chunk(&buf[..n])? {
            return Ok(response);
        }
    }
}

/// Everything a session task needs, moved into the task on spawn
pub(crate) struct SessionTask<C: Connector> {
    pub(crate) session: AgentSession,
    pub(crate) connector: Arc<C>,
    pub(crate) addr: SocketAddr,
    /// Taken and dropped right after it is written
    pub(crate) nonce: Option<Nonce>,
    pub(crate) connect_timeout: Duration,
    pub(crate) greeting_timeout: Duration,
    pub(crate) requests: mpsc::Receiver<AgentRequest>,
    pub(crate) registry: Registry,
    pub(crate) stats: Arc<RelayStats>,
    pub(crate) link: Option<Link<C::Stream>>,
    pub(crate) buf: Vec<u8>,
    /// Handshake completed and counted as opened
    pub(crate) opened: bool,
}

impl<C: Connector> SessionTask<C> {
    /// Build a task for a freshly registered session.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: AgentSession,
        connector: Arc<C>,
        addr: SocketAddr,
        nonce: Nonce,
        connect_timeout: Duration,
        greeting_timeout: Duration,
        requests: mpsc::Receiver<AgentRequest>,
        registry: Registry,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            session,
            connector,
            addr,
            nonce: Some(nonce),
            connect_timeout,
            greeting_timeout,
            requests,
            registry,
            stats,
            link: None,
            buf: vec![0u8; READ_CHUNK],
            opened: false,
        }
    }

    /// Handshake, serve commands, tear down.
    ///
    /// The greeting (or the handshake failure) is reported through `ready`.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<Bytes>>) {
        match self.handshake().await {
            Ok(greeting) => {
                self.opened = true;
                self.stats.record_opened();
                tracing::info!(session = %self.session.id(), addr = %self.addr, "agent session ready");
                let exit = if ready.send(Ok(greeting)).is_ok() {
                    self.serve().await
                } else {
                    Exit::Orphaned
                };
                self.teardown(exit).await;
            },
            Err(exit) => {
                // The caller learns of the failure only once the session is gone.
                let error = exit.pending_error();
                self.teardown(exit).await;
                let _ = ready.send(Err(error));
            },
        }
    }

    async fn handshake(&mut self) -> std::result::Result<Bytes, Exit> {
        self.session.begin_connect()?;

        let connect = tokio::time::timeout(self.connect_timeout, self.connector.connect(self.addr));
        let stream = match guard(connect, &mut self.requests).await? {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RelayError::Transport(format!("connect to {}: {e}", self.addr)).into())
            },
            Err(_) => {
                return Err(RelayError::Timeout(format!(
                    "connect to {} took longer than {:?}",
                    self.addr, self.connect_timeout
                ))
                .into())
            },
        };

        let link = self.link.insert(Link::new(stream));
        self.session.socket_connected()?;

        if let Some(nonce) = self.nonce.take() {
            guard(link.write_all(nonce.as_bytes()), &mut self.requests)
                .await?
                .map_err(|e| RelayError::Transport(format!("write nonce: {e}")))?;
        }
        self.session.write_ok()?;

        let greeting = tokio::time::timeout(
            self.greeting_timeout,
            read_response(link, &mut self.session, &mut self.buf),
        );
        let greeting = match guard(greeting, &mut self.requests).await? {
            Ok(response) => response?,
            Err(_) => {
                return Err(RelayError::Timeout(format!(
                    "no greeting within {:?}",
                    self.greeting_timeout
                ))
                .into())
            },
        };

        if greeting.kind != ResponseKind::Ok || !greeting.data.starts_with(b"OK") {
            return Err(RelayError::ProtocolViolation(format!(
                "agent greeting was not OK: {}",
                sanitize(&greeting.data)
            ))
            .into());
        }

        Ok(greeting.data)
    }

    /// Command loop. Returns once the session must leave service.
    async fn serve(&mut self) -> Exit {
        loop {
            let Some(link) = self.link.as_mut() else {
                return Exit::Failed(RelayError::Transport("no transport".to_string()));
            };

            let request = tokio::select! {
                request = self.requests.recv() => request,
                read = link.read(&mut self.buf) => {
                    return match read {
                        Ok(0) => Exit::Closed,
                        Ok(n) => Exit::Failed(RelayError::ProtocolViolation(format!(
                            "unsolicited data from agent: {}",
                            sanitize(&self.buf[..n])
                        ))),
                        Err(e) => Exit::Failed(RelayError::Transport(format!("read from agent: {e}"))),
                    };
                },
            };

            match request {
                None => return Exit::Orphaned,
                Some(AgentRequest::Disconnect { reply }) => return Exit::Disconnect(reply),
                Some(AgentRequest::Send { block, reply }) => {
                    if let Err(e) = self.session.begin_send(&block) {
                        let _ = reply.send(Err(e));
                        continue;
                    }

                    match self.exchange(&block).await {
                        Ok(response) => {
                            self.stats.record_command(block.len(), response.data.len());
                            tracing::debug!(
                                session = %self.session.id(),
                                kind = %response.kind,
                                response = %sanitize(&response.data),
                                "response complete"
                            );
                            let _ = reply.send(Ok(response.data));
                        },
                        Err(exit) => {
                            let _ = reply.send(Err(exit.pending_error()));
                            return exit;
                        },
                    }
                },
            }
        }
    }

    /// Write `block` and read its response. The session is in `Sending`.
    async fn exchange(&mut self, block: &[u8]) -> std::result::Result<AgentResponse, Exit> {
        let Some(link) = self.link.as_mut() else {
            return Err(RelayError::Transport("no transport".to_string()).into());
        };

        guard(link.write_all(block), &mut self.requests)
            .await?
            .map_err(|e| RelayError::Transport(format!("write to agent: {e}")))?;
        self.session.write_ok()?;

        let response = guard(
            read_response(link, &mut self.session, &mut self.buf),
            &mut self.requests,
        )
        .await??;
        Ok(response)
    }

    /// Error → cleanup → `Disconnected` | `Fatal`, then leave the registry.
    async fn teardown(mut self, exit: Exit) {
        let id = self.session.id().to_string();
        let had_error = matches!(exit, Exit::Failed(_));
        if let Exit::Failed(e) = &exit {
            self.session.fail(e.clone());
        }

        let outcome = if self.session.request_cleanup(had_error) {
            let cleanup = self.link.as_mut().map_or(Ok(()), cleanup_transport);
            self.session.finish_cleanup(cleanup)
        } else {
            Err(RelayError::Cleanup(format!(
                "cleanup not accepted in state {:?}",
                self.session.state()
            )))
        };

        self.registry.write().await.remove(&id);
        if self.opened {
            self.stats.record_closed(outcome.is_err());
        }

        if let Exit::Disconnect(reply) = exit {
            let _ = reply.send(outcome);
        }

        // Anything still queued is answered rather than dropped.
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let gone = RelayError::SessionNotFound(id.clone());
            match request {
                AgentRequest::Send { reply, .. } => {
                    let _ = reply.send(Err(gone));
                },
                AgentRequest::Disconnect { reply } => {
                    let _ = reply.send(Err(gone));
                },
            }
        }
    }
}
