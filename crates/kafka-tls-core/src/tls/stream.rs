//! The established secure channel to a broker.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use rustls::pki_types::CertificateDer;
use rustls::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;

/// A mutually authenticated TLS stream to a broker.
///
/// Only produced by a successful handshake. Bytes the broker sent while the
/// client certificate verdict was pending are replayed before further reads.
pub struct SecureChannel<S> {
    inner: TlsStream<S>,
    server_name: String,
    buffered: BytesMut,
}

impl<S> SecureChannel<S> {
    pub(crate) fn new(inner: TlsStream<S>, server_name: String, buffered: BytesMut) -> Self {
        Self {
            inner,
            server_name,
            buffered,
        }
    }

    /// The server name the broker certificate was verified against.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The negotiated protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.inner.get_ref().1.protocol_version()
    }

    /// The broker's certificate chain, leaf first.
    #[must_use]
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.inner.get_ref().1.peer_certificates()
    }

    /// The underlying transport stream.
    #[must_use]
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref().0
    }

    /// Unwrap into the TLS stream. Replayed bytes must be drained first.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged if unread replay bytes remain.
    pub fn into_inner(self) -> Result<TlsStream<S>, Self> {
        if self.buffered.is_empty() {
            Ok(self.inner)
        } else {
            Err(self)
        }
    }
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("server_name", &self.server_name)
            .field("protocol_version", &self.protocol_version())
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

impl<S> AsyncRead for SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
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
