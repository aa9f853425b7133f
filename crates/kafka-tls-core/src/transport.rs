//! Raw byte-stream transports used underneath TLS.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default dial timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces raw, unauthenticated byte streams to broker addresses.
///
/// Implementations must allow concurrent independent dials.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The stream type returned by [`Transport::dial`].
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `address`.
    async fn dial(&self, address: &str) -> io::Result<Self::Stream>;
}

/// TCP transport with a dial timeout.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a TCP transport with the given dial timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Get the dial timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn dial(&self, address: &str) -> io::Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection timeout after {:?}", self.connect_timeout),
                ))
            }
        };

        stream.set_nodelay(true)?;
        debug!(address, "TCP connection established");
        Ok(stream)
    }
}
