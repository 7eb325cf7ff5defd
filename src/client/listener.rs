//! Client-side coordinator: accepts protocol clients on a local socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock, Semaphore};

use super::driver::{stopped, ClientTask};
use super::session::ClientSession;
use crate::bridge::AgentBridge;
use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::framing::{cleanup_transport, Detach, Link};
use crate::stats::RelayStats;

/// Control handle of a live client session task
#[derive(Debug)]
pub(crate) struct ClientHandle {
    /// Set to `true` to request cleanup; closed once the task has ended
    cleanup: watch::Sender<bool>,
}

/// Shared session registry; session tasks remove themselves on exit
pub(crate) type ClientRegistry = Arc<RwLock<HashMap<String, ClientHandle>>>;

/// Accepts client connections and owns their sessions.
pub struct ClientListener<B: AgentBridge> {
    /// Client configuration
    config: ClientConfig,
    /// Agent side
    bridge: Arc<B>,
    /// Live sessions by ID
    sessions: ClientRegistry,
    /// One permit per live session
    slots: Arc<Semaphore>,
    /// Counters
    stats: Arc<RelayStats>,
    /// Stops the accept loop
    shutdown: watch::Sender<bool>,
    /// The socket file was created by [`ClientListener::bind`]
    bound: AtomicBool,
}

impl<B: AgentBridge> ClientListener<B> {
    /// Create a listener that forwards through `bridge`.
    pub fn new(config: ClientConfig, bridge: Arc<B>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            slots: Arc::new(Semaphore::new(config.max_sessions.min(Semaphore::MAX_PERMITS))),
            config,
            bridge,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RelayStats::new()),
            shutdown,
            bound: AtomicBool::new(false),
        }
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Counters shared with the session tasks
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Number of tracked sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Start a session on an accepted stream.
    ///
    /// At the concurrency cap the stream is closed at once and
    /// `CapacityExceeded` is returned. Once [`ClientListener::stop`] has
    /// begun, every stream is closed and refused.
    pub async fn accept_stream<S: Detach>(&self, stream: S) -> Result<String> {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            tracing::warn!(limit = self.config.max_sessions, "client refused at capacity");
            self.refuse(stream);
            return Err(RelayError::CapacityExceeded {
                limit: self.config.max_sessions,
            });
        };

        let id = uuid::Uuid::new_v4().to_string();
        let (cleanup, signal) = watch::channel(false);
        {
            // stop() raises the flag before it drains, so a session is
            // either refused here or drained and signalled there.
            let mut sessions = self.sessions.write().await;
            if *self.shutdown.borrow() {
                drop(sessions);
                tracing::debug!("client refused, listener is stopping");
                self.refuse(stream);
                return Err(RelayError::Transport("client listener is stopping".to_string()));
            }
            sessions.insert(id.clone(), ClientHandle { cleanup });
        }

        let task = ClientTask::new(
            ClientSession::new(id.clone(), self.config.max_buffer_bytes),
            stream,
            Arc::clone(&self.bridge),
            self.config.idle_timeout(),
            signal,
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
            Some(permit),
        );
        tokio::spawn(task.run());

        tracing::debug!(session = %id, "client accepted");
        Ok(id)
    }

    /// Close a stream that will not get a session.
    fn refuse<S: Detach>(&self, stream: S) {
        self.stats.record_rejected();
        let mut link = Link::new(stream);
        if let Err(e) = cleanup_transport(&mut link) {
            tracing::debug!(error = %e, "closing refused client failed");
        }
    }

    /// Ask every session to clean up and wait until each task has ended.
    ///
    /// Also stops [`ClientListener::serve`]. Calling it again, or while a
    /// session is already tearing down, is harmless.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let handles: Vec<(String, ClientHandle)> = self.sessions.write().await.drain().collect();
        tracing::info!(sessions = handles.len(), "stopping client listener");

        let waits = handles.into_iter().map(|(id, handle)| async move {
            handle.cleanup.send_replace(true);
            handle.cleanup.closed().await;
            tracing::debug!(session = %id, "client session stopped");
        });
        futures::future::join_all(waits).await;

        #[cfg(unix)]
        self.remove_socket();
    }
}

#[cfg(unix)]
impl<B: AgentBridge> ClientListener<B> {
    /// Bind the configured socket path.
    ///
    /// A stale socket file is replaced; one with a live listener behind it
    /// is an error. The socket gets `socket_mode` permissions.
    pub fn bind(&self) -> Result<tokio::net::UnixListener> {
        use std::os::unix::fs::PermissionsExt;

        let path = &self.config.socket_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(RelayError::Config(format!(
                    "{} is in use by a running agent",
                    path.display()
                )));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)?;
        }

        let listener = tokio::net::UnixListener::bind(path)?;
        self.bound.store(true, Ordering::Release);
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.config.socket_mode))?;
        tracing::info!(
            path = %path.display(),
            mode = %format!("{:o}", self.config.socket_mode),
            "client socket listening"
        );
        Ok(listener)
    }

    /// Accept clients until [`ClientListener::stop`].
    pub async fn serve(&self, listener: tokio::net::UnixListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    },
                },
                () = stopped(&mut shutdown) => break,
            };

            // Refusals are logged and counted by accept_stream.
            let _ = self.accept_stream(stream).await;
        }

        tracing::info!("client accept loop stopped");
        Ok(())
    }

    fn remove_socket(&self) {
        if !self.bound.swap(false, Ordering::AcqRel) {
            return;
        }
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => tracing::debug!(path = %self.config.socket_path.display(), "socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => tracing::warn!(error = %e, "failed to remove socket"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Connected;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Greets, then answers `SIGN` with an INQUIRE and everything else with `OK`.
    #[derive(Default)]
    struct ScriptedBridge {
        sent: std::sync::Mutex<Vec<Bytes>>,
        disconnects: AtomicUsize,
        /// `send` records the block and never answers
        stall_sends: bool,
    }

    impl AgentBridge for ScriptedBridge {
        fn connect(&self, _session_id: Option<String>) -> BoxFuture<'_, Result<Connected>> {
            Box::pin(async {
                Ok(Connected {
                    session_id: "remote".to_string(),
                    greeting: Bytes::from_static(b"OK Pleased to meet you\n"),
                })
            })
        }

        fn send(&self, _session_id: String, block: Bytes) -> BoxFuture<'_, Result<Bytes>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(block.clone());
                if self.stall_sends {
                    return std::future::pending::<Result<Bytes>>().await;
                }
                if block.starts_with(b"SIGN") {
                    Ok(Bytes::from_static(b"INQUIRE PASSPHRASE\n"))
                } else {
                    Ok(Bytes::from_static(b"OK\n"))
                }
            })
        }

        fn disconnect(&self, _session_id: String) -> BoxFuture<'_, Result<()>> {
            Box::pin(async {
                self.disconnects.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }
    }

    async fn read_until_newline(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read_exact(&mut byte).await.is_ok() {
            out.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn test_inquire_relay_over_duplex() {
        let bridge = Arc::new(ScriptedBridge::default());
        let listener = ClientListener::new(ClientConfig::default(), Arc::clone(&bridge));
        let (mut client, server) = tokio::io::duplex(4096);
        listener.accept_stream(server).await.unwrap();

        assert_eq!(read_until_newline(&mut client).await, b"OK Pleased to meet you\n");

        client.write_all(b"SIGN\n").await.unwrap();
        assert_eq!(read_until_newline(&mut client).await, b"INQUIRE PASSPHRASE\n");

        client.write_all(b"D secret\nEND\n").await.unwrap();
        assert_eq!(read_until_newline(&mut client).await, b"OK\n");

        let sent = bridge.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                Bytes::from_static(b"SIGN\n"),
                Bytes::from_static(b"D secret\nEND\n")
            ]
        );

        drop(client);
        listener.stop().await;
        assert_eq!(listener.session_count().await, 0);
        let summary = listener.stats().summary();
        assert_eq!(summary.commands, 2);
        assert_eq!(summary.inquiries, 1);
    }

    #[tokio::test]
    async fn test_capacity_refuses_extra_client() {
        let bridge = Arc::new(ScriptedBridge::default());
        let config = ClientConfig::default().with_max_sessions(1);
        let listener = ClientListener::new(config, bridge);

        let (_first, server) = tokio::io::duplex(1024);
        listener.accept_stream(server).await.unwrap();

        let (mut second, server) = tokio::io::duplex(1024);
        let err = listener.accept_stream(server).await.unwrap_err();
        assert_eq!(err, RelayError::CapacityExceeded { limit: 1 });

        let mut buf = [0u8; 8];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);
        assert_eq!(listener.stats().summary().rejected, 1);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_and_agent_side_closed() {
        let bridge = Arc::new(ScriptedBridge::default());
        let listener = ClientListener::new(ClientConfig::default(), Arc::clone(&bridge));
        let (mut client, server) = tokio::io::duplex(1024);
        listener.accept_stream(server).await.unwrap();
        read_until_newline(&mut client).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            listener.stop().await;
            listener.stop().await;
        })
        .await
        .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.disconnects.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accept_after_stop_is_refused() {
        let listener = ClientListener::new(ClientConfig::default(), Arc::new(ScriptedBridge::default()));
        listener.stop().await;

        let (mut client, server) = tokio::io::duplex(1024);
        let err = listener.accept_stream(server).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(listener.session_count().await, 0);
        assert_eq!(listener.stats().summary().rejected, 1);
    }

    #[tokio::test]
    async fn test_oversized_session_cap_is_clamped() {
        let config = ClientConfig::default().with_max_sessions(usize::MAX);
        let listener = ClientListener::new(config, Arc::new(ScriptedBridge::default()));
        let (mut client, server) = tokio::io::duplex(1024);
        listener.accept_stream(server).await.unwrap();
        assert_eq!(read_until_newline(&mut client).await, b"OK Pleased to meet you\n");
        listener.stop().await;
    }

    /// A session with a `send` that never resolves, its command already out.
    async fn stalled_session() -> (Arc<ScriptedBridge>, ClientListener<ScriptedBridge>, tokio::io::DuplexStream) {
        let bridge = Arc::new(ScriptedBridge {
            stall_sends: true,
            ..ScriptedBridge::default()
        });
        let listener = ClientListener::new(ClientConfig::default(), Arc::clone(&bridge));
        let (mut client, server) = tokio::io::duplex(1024);
        listener.accept_stream(server).await.unwrap();
        read_until_newline(&mut client).await;

        client.write_all(b"PKSIGN\n").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        (bridge, listener, client)
    }

    async fn wait_for_disconnect(bridge: &ScriptedBridge) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.disconnects.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_pending_send() {
        let (bridge, listener, mut client) = stalled_session().await;

        tokio::time::timeout(Duration::from_secs(2), listener.stop())
            .await
            .unwrap();
        assert_eq!(listener.session_count().await, 0);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        wait_for_disconnect(&bridge).await;
    }

    #[tokio::test]
    async fn test_client_close_with_send_pending_detaches() {
        let (bridge, listener, client) = stalled_session().await;
        drop(client);

        wait_for_disconnect(&bridge).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while listener.session_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(listener.stats().summary().commands, 0);
    }

    #[tokio::test]
    async fn test_idle_client_is_reclaimed() {
        let bridge = Arc::new(ScriptedBridge::default());
        let config = ClientConfig::default().with_idle_timeout(Duration::from_millis(50));
        let listener = ClientListener::new(config, bridge);
        let (mut client, server) = tokio::io::duplex(1024);
        listener.accept_stream(server).await.unwrap();

        assert_eq!(read_until_newline(&mut client).await, b"OK Pleased to meet you\n");
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnupg").join("S.gpg-agent");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let config = ClientConfig::default().with_socket(&path);
        let listener = ClientListener::new(config, Arc::new(ScriptedBridge::default()));
        let socket = listener.bind().unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let second = ClientListener::new(
            ClientConfig::default().with_socket(&path),
            Arc::new(ScriptedBridge::default()),
        );
        assert!(matches!(second.bind(), Err(RelayError::Config(_))));

        drop(socket);
        listener.stop().await;
        assert!(!path.exists());
    }
}
