//! Per-connection task driving one client session.
//!
//! Bridge calls run on their own tasks. When the session tears down while
//! a call is still in flight, the call is left to finish on its own and
//! its result is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit};

use super::listener::ClientRegistry;
use super::session::{ClientSession, Unit};
use crate::bridge::{AgentBridge, Connected};
use crate::error::{RelayError, Result};
use crate::framing::{cleanup_transport, sanitize, Detach, Link};
use crate::stats::RelayStats;

/// Read buffer size for client chunks
const READ_CHUNK: usize = 8 * 1024;

/// Why the session is leaving service
#[derive(Debug)]
enum Exit {
    /// The client closed its end
    Closed,
    /// The listener asked for cleanup
    Shutdown,
    /// Something failed
    Failed(RelayError),
}

impl From<RelayError> for Exit {
    fn from(err: RelayError) -> Self {
        Exit::Failed(err)
    }
}

/// Resolves once cleanup is signalled.
///
/// A dropped sender means the listener is gone, which counts as a signal.
pub(crate) async fn stopped(cleanup: &mut watch::Receiver<bool>) {
    let _ = cleanup.wait_for(|stop| *stop).await;
}

/// Wait for `fut` unless cleanup is signalled first.
async fn interruptible<F: Future>(
    fut: F,
    cleanup: &mut watch::Receiver<bool>,
) -> std::result::Result<F::Output, Exit> {
    tokio::select! {
        out = fut => Ok(out),
        () = stopped(cleanup) => Err(Exit::Shutdown),
    }
}

/// Everything a client session task needs, moved into the task on spawn
pub(crate) struct ClientTask<S: Detach, B: AgentBridge> {
    pub(crate) session: ClientSession,
    pub(crate) link: Link<S>,
    pub(crate) bridge: Arc<B>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) cleanup: watch::Receiver<bool>,
    pub(crate) registry: ClientRegistry,
    pub(crate) stats: Arc<RelayStats>,
    /// Released when the task ends, freeing a slot under the cap
    pub(crate) permit: Option<OwnedSemaphorePermit>,
    pub(crate) buf: Vec<u8>,
    /// Handshake completed and counted as opened
    pub(crate) opened: bool,
}

impl<S: Detach, B: AgentBridge> ClientTask<S, B> {
    /// Build a task for an accepted connection.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: ClientSession,
        stream: S,
        bridge: Arc<B>,
        idle_timeout: Option<Duration>,
        cleanup: watch::Receiver<bool>,
        registry: ClientRegistry,
        stats: Arc<RelayStats>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            session,
            link: Link::new(stream),
            bridge,
            idle_timeout,
            cleanup,
            registry,
            stats,
            permit,
            buf: vec![0u8; READ_CHUNK],
            opened: false,
        }
    }

    /// Handshake, relay, tear down.
    pub(crate) async fn run(mut self) {
        let exit = match self.session.accept() {
            Ok(()) => self.serve().await,
            Err(e) => Exit::Failed(e),
        };
        self.teardown(exit).await;
    }

    async fn serve(&mut self) -> Exit {
        if let Err(exit) = self.handshake().await {
            return exit;
        }

        // Bounded only until the first byte, and only once the greeting is out.
        let mut idle = self.idle_timeout;

        loop {
            match self.session.next_unit() {
                Ok(Some(unit)) => {
                    if let Err(exit) = self.exchange(unit).await {
                        return exit;
                    }
                    continue;
                },
                Ok(None) => {},
                Err(e) => return Exit::Failed(e),
            }

            let read = self.link.read(&mut self.buf);
            let read = match idle {
                Some(limit) => match interruptible(tokio::time::timeout(limit, read), &mut self.cleanup).await {
                    Ok(Ok(read)) => read,
                    Ok(Err(_)) => {
                        return Exit::Failed(RelayError::Timeout(format!(
                            "client sent nothing within {limit:?}"
                        )))
                    },
                    Err(exit) => return exit,
                },
                None => match interruptible(read, &mut self.cleanup).await {
                    Ok(read) => read,
                    Err(exit) => return exit,
                },
            };

            match read {
                Ok(0) => return Exit::Closed,
                Ok(n) => {
                    idle = None;
                    if let Err(e) = self.session.push_client_data(&self.buf[..n]) {
                        return Exit::Failed(e);
                    }
                },
                Err(e) => return Exit::Failed(RelayError::Transport(format!("read from client: {e}"))),
            }
        }
    }

    /// Open the agent-side session and relay its greeting.
    ///
    /// The client transport is not read until the greeting is written.
    async fn handshake(&mut self) -> std::result::Result<(), Exit> {
        let (tx, rx) = oneshot::channel::<Result<Connected>>();
        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            let result = bridge.connect(None).await;
            // Nobody is waiting: close what was opened for them.
            if let Err(Ok(orphan)) = tx.send(result) {
                tracing::debug!(remote = %orphan.session_id, "closing session opened for a departed client");
                let _ = bridge.disconnect(orphan.session_id).await;
            }
        });

        let connected = interruptible(rx, &mut self.cleanup)
            .await?
            .map_err(|_| RelayError::Bridge("connect call dropped".to_string()))??;
        self.session.set_remote_id(connected.session_id.clone());

        interruptible(self.link.write_all(&connected.greeting), &mut self.cleanup)
            .await?
            .map_err(|e| RelayError::Transport(format!("write greeting: {e}")))?;

        self.session.connected(connected.session_id)?;
        self.opened = true;
        self.stats.record_opened();
        tracing::info!(
            session = %self.session.id(),
            remote = ?self.session.remote_id(),
            "client session ready"
        );
        Ok(())
    }

    /// Forward one unit and relay the response.
    ///
    /// While the call is in flight the client is still read: extra bytes
    /// are buffered for later, and a close ends the session.
    async fn exchange(&mut self, unit: Unit) -> std::result::Result<(), Exit> {
        let block = unit.block().clone();
        let remote = self
            .session
            .remote_id()
            .map(ToString::to_string)
            .ok_or_else(|| RelayError::ProtocolViolation("no agent-side session".to_string()))?;

        let (tx, mut rx) = oneshot::channel::<Result<Bytes>>();
        let bridge = Arc::clone(&self.bridge);
        let outgoing = block.clone();
        tokio::spawn(async move {
            let _ = tx.send(bridge.send(remote, outgoing).await);
        });
        self.session.dispatched()?;

        let response = loop {
            tokio::select! {
                response = &mut rx => break response,
                read = self.link.read(&mut self.buf) => match read {
                    Ok(0) => return Err(Exit::Closed),
                    Ok(n) => self.session.push_client_data(&self.buf[..n])?,
                    Err(e) => {
                        return Err(RelayError::Transport(format!("read from client: {e}")).into())
                    },
                },
                () = stopped(&mut self.cleanup) => return Err(Exit::Shutdown),
            }
        };

        let response = response.map_err(|_| RelayError::Bridge("send call dropped".to_string()))??;
        let kind = self.session.response_received(&response)?;

        interruptible(self.link.write_all(&response), &mut self.cleanup)
            .await?
            .map_err(|e| RelayError::Transport(format!("write to client: {e}")))?;
        self.session.relayed(kind)?;

        self.stats.record_command(block.len(), response.len());
        if matches!(unit, Unit::InquireReply(_)) {
            self.stats.record_inquiry();
        }
        tracing::debug!(
            session = %self.session.id(),
            %kind,
            response = %sanitize(&response),
            "response relayed"
        );
        Ok(())
    }

    /// Error → cleanup → `Disconnected` | `Fatal`; close the agent side
    /// best-effort; leave the registry.
    async fn teardown(mut self, exit: Exit) {
        let id = self.session.id().to_string();
        let had_error = matches!(exit, Exit::Failed(_));
        if let Exit::Failed(e) = exit {
            self.session.fail(e);
        }

        let outcome = if self.session.request_cleanup(had_error) {
            let cleanup = cleanup_transport(&mut self.link);
            self.session.finish_cleanup(cleanup)
        } else {
            Err(RelayError::Cleanup(format!(
                "cleanup not accepted in state {:?}",
                self.session.state()
            )))
        };

        if let Some(remote) = self.session.remote_id().map(ToString::to_string) {
            let bridge = Arc::clone(&self.bridge);
            tokio::spawn(async move {
                if let Err(e) = bridge.disconnect(remote.clone()).await {
                    tracing::debug!(%remote, error = %e, "agent-side disconnect failed");
                }
            });
        }

        if self.opened {
            self.stats.record_closed(outcome.is_err());
        }
        self.registry.write().await.remove(&id);
        drop(self.permit.take());
    }
}
