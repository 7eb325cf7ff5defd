//! JSON-lines bridge over TCP.
//!
//! The client side keeps one connection and may have many calls in flight
//! (one per client session). Responses come back in completion order and
//! are routed to their callers by request `id`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::wire::{decode_line, encode_line};
use super::{AgentBridge, BridgeCall, BridgeOutcome, BridgeRequest, BridgeResponse, Connected};
use crate::error::{RelayError, Result};
use crate::framing::decode_wire;

/// Pending calls by request ID; `None` once the connection is gone
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<BridgeOutcome>>>>>;

/// Sessions opened through one served connection; `None` once it has ended
type Owned = Arc<Mutex<Option<HashSet<String>>>>;

/// Read one `\n`-terminated line of at most `max` bytes into `line`.
///
/// Returns `false` on a clean EOF before any byte.
async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max: usize,
    line: &mut Vec<u8>,
) -> Result<bool> {
    line.clear();
    let n = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', line)
        .await?;

    if n == 0 {
        return Ok(false);
    }
    if line.len() > max {
        return Err(RelayError::BufferOverflow {
            limit: max,
            attempted: line.len(),
        });
    }
    if !line.ends_with(b"\n") {
        return Err(RelayError::Transport("bridge closed mid-message".to_string()));
    }
    Ok(true)
}

/// Resolves once `shutdown` turns `true` or its sender is dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drain `lines` into `writer` until either side goes away.
fn spawn_writer<W>(mut writer: W, mut lines: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(e) = writer.write_all(&line).await {
                tracing::warn!(error = %e, "bridge write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Client end of the stream bridge
#[derive(Debug)]
pub struct StreamBridge {
    /// Next request ID
    next_id: AtomicU64,
    /// Calls awaiting a response
    pending: Pending,
    /// Outgoing lines
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Response router
    reader: JoinHandle<()>,
    /// Line writer
    writer: JoinHandle<()>,
}

impl StreamBridge {
    /// Connect to a [`serve_bridge`] endpoint.
    pub async fn connect(addr: SocketAddr, max_line_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("bridge connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        tracing::info!(%addr, "bridge connected");

        let (read_half, write_half) = stream.into_split();
        let (outgoing, lines) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));

        let writer = spawn_writer(write_half, lines);
        let reader = tokio::spawn(Self::route_responses(
            BufReader::new(read_half),
            Arc::clone(&pending),
            max_line_bytes,
        ));

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            reader,
            writer,
        })
    }

    async fn route_responses<R: AsyncBufRead + Unpin>(mut reader: R, pending: Pending, max: usize) {
        let mut line = Vec::new();
        loop {
            match read_bounded_line(&mut reader, max, &mut line).await {
                Ok(true) => {},
                Ok(false) => {
                    tracing::info!("bridge closed by peer");
                    break;
                },
                Err(e) => {
                    tracing::warn!(error = %e, "bridge read failed");
                    break;
                },
            }

            let response: BridgeResponse = match decode_line(&line) {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed bridge response");
                    break;
                },
            };

            let waiter = pending
                .lock()
                .await
                .as_mut()
                .and_then(|calls| calls.remove(&response.id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response.outcome);
                },
                None => tracing::debug!(id = response.id, "response for unknown call"),
            }
        }

        // Dropping the senders fails every pending call.
        let abandoned = pending.lock().await.take().map_or(0, |calls| calls.len());
        if abandoned > 0 {
            tracing::warn!(abandoned, "bridge lost with calls in flight");
        }
    }

    /// Whether the connection is still usable
    pub async fn is_open(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    async fn call(&self, call: BridgeCall) -> Result<BridgeOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_line(&BridgeRequest { id, call })?;
        let (tx, rx) = oneshot::channel();

        match self.pending.lock().await.as_mut() {
            Some(calls) => {
                calls.insert(id, tx);
            },
            None => return Err(Self::closed()),
        }

        if self.outgoing.send(line).is_err() {
            if let Some(calls) = self.pending.lock().await.as_mut() {
                calls.remove(&id);
            }
            return Err(Self::closed());
        }

        rx.await.map_err(|_| Self::closed())
    }

    fn closed() -> RelayError {
        RelayError::Transport("bridge connection closed".to_string())
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl AgentBridge for StreamBridge {
    fn connect(&self, session_id: Option<String>) -> BoxFuture<'_, Result<Connected>> {
        Box::pin(async move { self.call(BridgeCall::Connect { session_id }).await?.into_connected() })
    }

    fn send(&self, session_id: String, block: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move { self.call(BridgeCall::send(session_id, &block)).await?.into_response() })
    }

    fn disconnect(&self, session_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.call(BridgeCall::Disconnect { session_id })
                .await?
                .into_disconnected()
        })
    }
}

/// Run one call against the local bridge.
async fn dispatch<B: AgentBridge>(bridge: &B, call: BridgeCall) -> BridgeOutcome {
    let result = match call {
        BridgeCall::Connect { session_id } => bridge
            .connect(session_id)
            .await
            .map(|connected| BridgeOutcome::connected(&connected)),
        BridgeCall::Send { session_id, block } => match decode_wire(&block) {
            Ok(block) => bridge
                .send(session_id, Bytes::from(block))
                .await
                .map(|response| BridgeOutcome::response(&response)),
            Err(e) => Err(e),
        },
        BridgeCall::Disconnect { session_id } => bridge
            .disconnect(session_id)
            .await
            .map(|()| BridgeOutcome::Disconnected),
    };

    result.unwrap_or_else(|e| BridgeOutcome::failed(&e))
}

/// Serve bridge connections until `shutdown` turns `true`.
///
/// Each request runs on its own task, since a call may wait on the backend
/// indefinitely. Sessions opened through a connection are disconnected
/// when that connection ends.
pub async fn serve_bridge<B: AgentBridge>(
    listener: TcpListener,
    bridge: Arc<B>,
    max_line_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "bridge listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = stopped(&mut shutdown) => break,
        };
        let Some((stream, peer)) = accepted_peer(accepted) else {
            continue;
        };

        tracing::info!(%peer, "bridge peer connected");
        let _ = stream.set_nodelay(true);
        tokio::spawn(serve_connection(
            stream,
            Arc::clone(&bridge),
            max_line_bytes,
            shutdown.clone(),
        ));
    }

    tracing::info!("bridge listener stopped");
    Ok(())
}

/// Accept errors (EMFILE and the like) end one attempt, not the server.
fn accepted_peer(accepted: std::io::Result<(TcpStream, SocketAddr)>) -> Option<(TcpStream, SocketAddr)> {
    match accepted {
        Ok(peer) => Some(peer),
        Err(e) => {
            tracing::warn!(error = %e, "bridge accept failed");
            None
        },
    }
}

async fn serve_connection<B: AgentBridge>(
    stream: TcpStream,
    bridge: Arc<B>,
    max_line_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (outgoing, lines) = mpsc::unbounded_channel();
    let writer = spawn_writer(write_half, lines);
    let owned: Owned = Arc::new(Mutex::new(Some(HashSet::new())));
    let mut line = Vec::new();

    loop {
        let read = tokio::select! {
            read = read_bounded_line(&mut reader, max_line_bytes, &mut line) => read,
            () = stopped(&mut shutdown) => break,
        };

        match read {
            Ok(true) => {},
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(error = %e, "bridge request read failed");
                break;
            },
        }

        let request: BridgeRequest = match decode_line(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed bridge request, closing");
                break;
            },
        };

        let bridge = Arc::clone(&bridge);
        let outgoing = outgoing.clone();
        let owned = Arc::clone(&owned);
        tokio::spawn(async move {
            let BridgeRequest { id, call } = request;
            let closing = match &call {
                BridgeCall::Disconnect { session_id } => Some(session_id.clone()),
                _ => None,
            };

            let outcome = dispatch(&*bridge, call).await;
            match (&outcome, closing) {
                (BridgeOutcome::Connected { session_id, .. }, _) => {
                    let adopted = owned
                        .lock()
                        .await
                        .as_mut()
                        .map(|sessions| sessions.insert(session_id.clone()))
                        .is_some();
                    if !adopted {
                        // The peer left while this connect was in flight.
                        tracing::info!(session = %session_id, "bridge peer gone, closing late session");
                        if let Err(e) = bridge.disconnect(session_id.clone()).await {
                            tracing::debug!(session = %session_id, error = %e, "late session disconnect failed");
                        }
                    }
                },
                (_, Some(session_id)) => {
                    if let Some(sessions) = owned.lock().await.as_mut() {
                        sessions.remove(&session_id);
                    }
                },
                _ => {},
            }

            match encode_line(&BridgeResponse { id, outcome }) {
                Ok(line) => {
                    let _ = outgoing.send(line);
                },
                Err(e) => tracing::error!(id, error = %e, "failed to encode bridge response"),
            }
        });
    }

    drop(outgoing);
    let orphans: Vec<String> = owned.lock().await.take().into_iter().flatten().collect();
    if !orphans.is_empty() {
        tracing::info!(sessions = orphans.len(), "bridge peer gone, closing its sessions");
    }
    for session_id in orphans {
        if let Err(e) = bridge.disconnect(session_id.clone()).await {
            tracing::debug!(session = %session_id, error = %e, "orphan disconnect failed");
        }
    }

    // In-flight calls still hold a sender; the writer ends once they finish.
    let _ = writer.await;
}
