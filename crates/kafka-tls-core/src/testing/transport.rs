//! A TCP transport that counts dials and open streams.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::transport::{TcpTransport, Transport};

#[derive(Debug, Default)]
struct Counters {
    dials: AtomicUsize,
    open: AtomicUsize,
}

/// Wraps [`TcpTransport`] so tests can assert streams are released.
///
/// Clones share counters.
#[derive(Debug, Clone, Default)]
pub struct TrackingTransport {
    inner: TcpTransport,
    counters: Arc<Counters>,
}

impl TrackingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dial attempts, successful or not.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.counters.dials.load(Ordering::SeqCst)
    }

    /// Number of dialed streams not yet dropped.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    type Stream = TrackedStream;

    async fn dial(&self, address: &str) -> io::Result<Self::Stream> {
        self.counters.dials.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.dial(address).await?;
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(TrackedStream {
            inner,
            counters: Arc::clone(&self.counters),
        })
    }
}

/// A TCP stream that decrements the open count when dropped.
#[derive(Debug)]
pub struct TrackedStream {
    inner: TcpStream,
    counters: Arc<Counters>,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
