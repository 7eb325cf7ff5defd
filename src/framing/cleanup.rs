//! Ordered, best-effort transport teardown.
//!
//! Teardown is two fallible steps: deregister the handle from the I/O
//! driver so no further readiness is delivered to the session, then
//! destroy the socket. Both steps always run; the first failure is the
//! one reported.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{RelayError, Result};

/// A transport handle that can be torn down in two steps.
pub trait Teardown {
    /// Stop delivering I/O events for this handle.
    fn deregister(&mut self) -> io::Result<()>;

    /// Close the underlying handle.
    fn destroy(&mut self) -> io::Result<()>;
}

/// Run [`Teardown::deregister`] then [`Teardown::destroy`], unconditionally.
///
/// Returns the first error encountered, as [`RelayError::Cleanup`].
pub fn cleanup_transport<T: Teardown + ?Sized>(handle: &mut T) -> Result<()> {
    let mut first: Option<RelayError> = None;

    let outcomes = [
        ("deregister", handle.deregister()),
        ("destroy", handle.destroy()),
    ];

    for (step, outcome) in outcomes {
        if let Err(e) = outcome {
            tracing::warn!(step, error = %e, "transport cleanup step failed");
            first.get_or_insert(RelayError::Cleanup(format!("{step}: {e}")));
        }
    }

    first.map_or(Ok(()), Err)
}

/// Async stream that can leave the runtime's reactor.
pub trait Detach: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    /// Handle left after leaving the reactor.
    type Detached: Send + Unpin;

    /// Deregister from the reactor.
    fn detach(self) -> io::Result<Self::Detached>;

    /// Shut the detached handle down in both directions.
    fn destroy(detached: Self::Detached) -> io::Result<()>;
}

/// A peer that already went away leaves nothing to shut down.
fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Detach for tokio::net::TcpStream {
    type Detached = std::net::TcpStream;

    fn detach(self) -> io::Result<Self::Detached> {
        self.into_std()
    }

    fn destroy(detached: Self::Detached) -> io::Result<()> {
        ignore_not_connected(detached.shutdown(std::net::Shutdown::Both))
    }
}

#[cfg(unix)]
impl Detach for tokio::net::UnixStream {
    type Detached = std::os::unix::net::UnixStream;

    fn detach(self) -> io::Result<Self::Detached> {
        self.into_std()
    }

    fn destroy(detached: Self::Detached) -> io::Result<()> {
        ignore_not_connected(detached.shutdown(std::net::Shutdown::Both))
    }
}

/// In-memory pipes have no reactor registration; dropping closes them.
impl Detach for tokio::io::DuplexStream {
    type Detached = tokio::io::DuplexStream;

    fn detach(self) -> io::Result<Self::Detached> {
        Ok(self)
    }

    fn destroy(detached: Self::Detached) -> io::Result<()> {
        drop(detached);
        Ok(())
    }
}

/// Owned session transport.
///
/// Reads and writes pass through to the stream while it is live. After
/// [`Teardown::deregister`] every I/O call fails with `NotConnected`.
pub struct Link<S: Detach> {
    live: Option<S>,
    detached: Option<S::Detached>,
}

impl<S: Detach> Link<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            live: Some(stream),
            detached: None,
        }
    }

    /// Whether the stream has not been deregistered yet.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    fn live_mut(&mut self) -> io::Result<&mut S> {
        self.live
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport torn down"))
    }
}

impl<S: Detach> std::fmt::Debug for Link<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("live", &self.live.is_some())
            .field("detached", &self.detached.is_some())
            .finish()
    }
}

impl<S: Detach> Teardown for Link<S> {
    fn deregister(&mut self) -> io::Result<()> {
        if let Some(stream) = self.live.take() {
            self.detached = Some(stream.detach()?);
        }
        Ok(())
    }

    fn destroy(&mut self) -> io::Result<()> {
        match self.detached.take() {
            Some(detached) => S::destroy(detached),
            None => Ok(()),
        }
    }
}

impl<S: Detach> AsyncRead for Link<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().live_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<S: Detach> AsyncWrite for Link<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().live_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().live_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().live_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
