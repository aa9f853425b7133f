//! In-process TLS broker for integration testing.
//!
//! A lightweight broker stand-in that:
//! - Accepts TCP connections and runs the server side of a TLS handshake
//! - Verifies client certificates against the test CA
//! - Echoes application bytes back once the handshake succeeds
//! - Reports every server-side handshake failure to a [`FailureReporter`]

use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::version::{TLS12, TLS13};
use rustls::{ProtocolVersion, ServerConfig, SupportedProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsVersion;

use super::harness::FailureReporter;
use super::pki::TestPki;

/// How the broker treats client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthMode {
    /// A certificate signed by the test CA is mandatory.
    #[default]
    Required,
    /// A certificate is verified if offered.
    Optional,
    /// No certificate is requested.
    None,
}

/// Broker-side TLS settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsBrokerOptions {
    /// Client certificate policy.
    pub client_auth: ClientAuthMode,
    /// Highest protocol version the broker will negotiate.
    pub max_version: Option<TlsVersion>,
    /// Bytes written to the client right after the handshake.
    pub greeting: Option<&'static [u8]>,
}

impl TlsBrokerOptions {
    /// Only negotiate TLS 1.2.
    #[must_use]
    pub fn tls12_only(mut self) -> Self {
        self.max_version = Some(TlsVersion::Tls12);
        self
    }

    /// Send `greeting` as soon as the handshake completes.
    #[must_use]
    pub fn greeting(mut self, greeting: &'static [u8]) -> Self {
        self.greeting = Some(greeting);
        self
    }

    /// Set the client certificate policy.
    #[must_use]
    pub fn client_auth(mut self, mode: ClientAuthMode) -> Self {
        self.client_auth = mode;
        self
    }
}

/// A handshake the broker completed.
#[derive(Debug, Clone)]
pub struct AcceptedSession {
    /// Number of certificates the client presented.
    pub client_certificates: usize,
    /// The negotiated protocol version.
    pub protocol_version: Option<ProtocolVersion>,
}

/// In-process TLS broker.
pub struct TlsTestBroker {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    sessions: Arc<RwLock<Vec<AcceptedSession>>>,
}

impl TlsTestBroker {
    /// Bind to an ephemeral localhost port and start accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration is rejected or binding fails.
    pub async fn start(
        pki: &TestPki,
        options: TlsBrokerOptions,
        reporter: Arc<dyn FailureReporter>,
    ) -> std::io::Result<Self> {
        let server_config = build_server_config(pki, options)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let sessions = Arc::new(RwLock::new(Vec::new()));

        let accept_sessions = Arc::clone(&sessions);
        let accept_shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let acceptor = acceptor.clone();
                                let sessions = Arc::clone(&accept_sessions);
                                let reporter = Arc::clone(&reporter);
                                let shutdown_rx = accept_shutdown.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_connection(stream, acceptor, options, sessions, reporter, shutdown_rx).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(Self {
            address,
            shutdown_tx: Some(shutdown_tx),
            sessions,
        })
    }

    /// The `host:port` the broker listens on.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The address with `localhost` as the host, matching the broker certificate's DNS name.
    #[must_use]
    pub fn localhost_address(&self) -> String {
        match self.address.rsplit_once(':') {
            Some((_, port)) => format!("localhost:{port}"),
            None => self.address.clone(),
        }
    }

    /// Handshakes completed so far.
    pub async fn sessions(&self) -> Vec<AcceptedSession> {
        self.sessions.read().await.clone()
    }

    /// Stop accepting and close open sessions.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        acceptor: TlsAcceptor,
        options: TlsBrokerOptions,
        sessions: Arc<RwLock<Vec<AcceptedSession>>>,
        reporter: Arc<dyn FailureReporter>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let mut tls = match acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(e) => {
                reporter.report(format!("broker handshake with {peer} failed: {e}"));
                return;
            }
        };

        {
            let (_, connection) = tls.get_ref();
            sessions.write().await.push(AcceptedSession {
                client_certificates: connection.peer_certificates().map_or(0, <[_]>::len),
                protocol_version: connection.protocol_version(),
            });
        }

        if let Some(greeting) = options.greeting {
            if tls.write_all(greeting).await.is_err() || tls.flush().await.is_err() {
                return;
            }
        }

        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = tls.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = tls.flush().await;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TlsTestBroker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Build a rustls `ServerConfig` presenting the host certificate.
fn build_server_config(pki: &TestPki, options: TlsBrokerOptions) -> std::io::Result<ServerConfig> {
    let provider = Arc::new(default_provider());
    let versions: &[&SupportedProtocolVersion] = match options.max_version {
        Some(TlsVersion::Tls12) => &[&TLS12],
        _ => &[&TLS13, &TLS12],
    };

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)
        .map_err(std::io::Error::other)?;

    let builder = match options.client_auth {
        ClientAuthMode::Required => {
            builder.with_client_cert_verifier(build_client_verifier(pki, &provider, false)?)
        }
        ClientAuthMode::Optional => {
            builder.with_client_cert_verifier(build_client_verifier(pki, &provider, true)?)
        }
        ClientAuthMode::None => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(pki.host_chain(), pki.host_key())
        .map_err(std::io::Error::other)
}

/// Build a client certificate verifier trusting only the test CA.
fn build_client_verifier(
    pki: &TestPki,
    provider: &Arc<rustls::crypto::CryptoProvider>,
    allow_unauthenticated: bool,
) -> std::io::Result<Arc<dyn ClientCertVerifier>> {
    let builder =
        WebPkiClientVerifier::builder_with_provider(Arc::new(pki.ca_root_store()), Arc::clone(provider));
    let builder = if allow_unauthenticated {
        builder.allow_unauthenticated()
    } else {
        builder
    };

    builder.build().map_err(std::io::Error::other)
}
