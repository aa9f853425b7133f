//! TLS client connector for outbound broker connections.
//!
//! Dials a broker through a [`Transport`] and performs a mutually
//! authenticated TLS handshake over the raw stream. Every attempt builds its
//! own rustls `ClientConfig` from a freshly resolved [`EffectiveTlsConfig`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::client::ResolvesClientCert;
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, ProtocolVersion, SignatureScheme, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionConfig, TlsVersion};
use crate::error::{ConnectError, ConnectResult, HandshakeFailure, TlsError};
use crate::transport::{TcpTransport, Transport};

use super::failure::{classify_closed, classify_io, ClientAuthContext};
use super::identity::{CheckedIdentity, TlsIdentityConfig};
use super::server_name::{fallback_server_name, resolve, EffectiveTlsConfig};
use super::stream::SecureChannel;

/// Default TLS handshake timeout.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the broker's verdict on a TLS 1.3 client certificate.
const DEFAULT_CLIENT_AUTH_CONFIRM_TIMEOUT: Duration = Duration::from_millis(250);

static TLS12_AND_LATER: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

/// Install the ring crypto provider if not already installed.
fn ensure_crypto_provider() {
    // Try to install the ring provider, ignore errors if already installed
    let _ = CryptoProvider::install_default(default_provider());
}

/// The process-wide crypto provider, installing ring if none is set.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    ensure_crypto_provider();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(default_provider()))
}

/// Lifecycle of a single connection attempt.
///
/// `Secured` and `Failed` are terminal; a retry is a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// Resolving the server name and building the TLS configuration.
    Idle,
    /// Opening the raw transport stream.
    Dialing,
    /// Running the TLS handshake over the raw stream.
    Handshaking,
    /// The handshake succeeded and the channel was returned.
    Secured,
    /// The attempt failed; the raw stream has been closed.
    Failed,
}

/// Per-attempt record of whether the broker asked for a client certificate.
#[derive(Debug)]
struct ClientAuthTracker {
    certified: Option<Arc<CertifiedKey>>,
    key_unverified: bool,
    requested: AtomicBool,
}

impl ClientAuthTracker {
    fn new(identity: Option<CheckedIdentity>) -> Self {
        let (certified, key_unverified) = match identity {
            Some(checked) => (Some(checked.certified), checked.key_unverified),
            None => (None, false),
        };
        Self {
            certified,
            key_unverified,
            requested: AtomicBool::new(false),
        }
    }

    fn context(&self) -> ClientAuthContext {
        ClientAuthContext {
            requested: self.requested.load(Ordering::Acquire),
            offered: self.certified.is_some(),
            key_unverified: self.key_unverified,
        }
    }
}

impl ResolvesClientCert for ClientAuthTracker {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.requested.store(true, Ordering::Release);
        if self.certified.is_none() {
            warn!("broker requested a client certificate but none is configured");
        }
        self.certified.clone()
    }

    fn has_certs(&self) -> bool {
        self.certified.is_some()
    }
}

/// Establishes mutually authenticated TLS connections to brokers.
///
/// The connector holds no per-broker state: the same instance may run any
/// number of concurrent attempts. Dropping a pending [`SecureConnector::connect`]
/// future closes whatever stream it had opened.
#[derive(Debug, Clone)]
pub struct SecureConnector<T = TcpTransport> {
    transport: T,
    handshake_timeout: Duration,
    client_auth_confirm_timeout: Duration,
}

impl SecureConnector<TcpTransport> {
    /// Create a connector over TCP with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_transport(TcpTransport::default())
    }

    /// Create a TCP connector using the timeouts from configuration.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::with_transport(TcpTransport::new(config.connection_timeout()))
            .with_handshake_timeout(config.handshake_timeout())
            .with_client_auth_confirm_timeout(config.client_auth_confirm_timeout())
    }
}

impl Default for SecureConnector<TcpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> SecureConnector<T> {
    /// Create a connector over a custom transport.
    #[must_use]
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            client_auth_confirm_timeout: DEFAULT_CLIENT_AUTH_CONFIRM_TIMEOUT,
        }
    }

    /// Set the TLS handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Set how long to wait for the broker's verdict on the client
    /// certificate after a TLS 1.3 handshake. Zero disables the wait.
    #[must_use]
    pub fn with_client_auth_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.client_auth_confirm_timeout = confirm_timeout;
        self
    }

    /// Get the transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect to a broker over TLS.
    ///
    /// # Arguments
    ///
    /// * `address` - The broker address (host:port)
    /// * `config` - TLS settings; `None` means system roots and no client certificate
    ///
    /// # Errors
    ///
    /// Returns:
    /// - [`ConnectError::Config`] if the server name or trust store is unusable
    /// - [`ConnectError::LocalIdentity`] if the client key does not fit its certificate
    /// - [`ConnectError::Transport`] if the broker cannot be dialed
    /// - [`ConnectError::Handshake`] if the TLS handshake or client authentication fails
    #[instrument(skip(self, config))]
    pub async fn connect(
        &self,
        address: &str,
        config: Option<&TlsIdentityConfig>,
    ) -> ConnectResult<SecureChannel<T::Stream>> {
        let effective = resolve(address, config);
        let result = self.attempt(address, &effective).await;

        match &result {
            Ok(channel) => {
                info!(
                    server_name = channel.server_name(),
                    protocol = ?channel.protocol_version(),
                    phase = ?ConnectPhase::Secured,
                    "secure broker connection established"
                );
            }
            Err(e) => {
                warn!(
                    error = %e,
                    failed_in = ?e.phase(),
                    phase = ?ConnectPhase::Failed,
                    "secure broker connection failed"
                );
            }
        }

        result
    }

    async fn attempt(
        &self,
        address: &str,
        effective: &EffectiveTlsConfig<'_>,
    ) -> ConnectResult<SecureChannel<T::Stream>> {
        let derived = effective.server_name().is_empty();
        let server_name = if derived {
            fallback_server_name(address).to_string()
        } else {
            effective.server_name().to_string()
        };
        let config_error = |source: TlsError| ConnectError::Config {
            address: address.to_string(),
            source,
        };
        let handshake_error = |reason: HandshakeFailure| ConnectError::Handshake {
            address: address.to_string(),
            server_name: server_name.clone(),
            reason,
        };

        // Step 1: Build the per-attempt TLS configuration. A name taken from the
        // dial address that is still unusable fails once the stream is open.
        let peer_name = match ServerName::try_from(server_name.clone()) {
            Ok(name) => Some(name),
            Err(_) if derived => None,
            Err(e) => {
                return Err(config_error(TlsError::InvalidServerName {
                    name: server_name.clone(),
                    message: e.to_string(),
                }));
            }
        };
        if derived {
            debug!(server_name = %server_name, "no server name resolved, using dial address");
        }

        let provider = crypto_provider();
        let identity = effective.identity();
        let checked = identity
            .local_identity
            .as_ref()
            .map(|local| local.certified_key(&provider))
            .transpose()
            .map_err(|reason| ConnectError::LocalIdentity {
                address: address.to_string(),
                reason,
            })?;
        let tracker = Arc::new(ClientAuthTracker::new(checked));
        let client_config =
            build_client_config(identity, Arc::clone(&tracker), provider).map_err(config_error)?;

        // Step 2: Open the raw transport stream
        debug!(phase = ?ConnectPhase::Dialing, "dialing broker");
        let raw = self
            .transport
            .dial(address)
            .await
            .map_err(|source| ConnectError::Transport {
                address: address.to_string(),
                source,
            })?;

        let Some(peer_name) = peer_name else {
            drop(raw);
            return Err(handshake_error(HandshakeFailure::MissingServerName));
        };

        // Step 3: TLS handshake; a failed handshake drops the raw stream
        debug!(phase = ?ConnectPhase::Handshaking, server_name = %server_name, "initiating TLS handshake");
        let connector = TokioTlsConnector::from(Arc::new(client_config));
        let mut tls_stream = match timeout(self.handshake_timeout, connector.connect(peer_name, raw)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(handshake_error(classify_io(&e, &server_name, tracker.context())));
            }
            Err(_) => return Err(handshake_error(HandshakeFailure::Timeout)),
        };

        // Step 4: Under TLS 1.3 the broker judges the client certificate after
        // our handshake has completed.
        let auth = tracker.context();
        let negotiated = tls_stream.get_ref().1.protocol_version();
        let buffered = if auth.requested
            && negotiated == Some(ProtocolVersion::TLSv1_3)
            && !self.client_auth_confirm_timeout.is_zero()
        {
            match await_client_auth_verdict(
                &mut tls_stream,
                self.client_auth_confirm_timeout,
                &server_name,
                auth,
            )
            .await
            {
                Ok(buffered) => buffered,
                Err(reason) => {
                    drop(tls_stream);
                    return Err(handshake_error(reason));
                }
            }
        } else {
            BytesMut::new()
        };

        debug!("TLS handshake completed");
        Ok(SecureChannel::new(tls_stream, server_name, buffered))
    }
}

/// Wait briefly for the broker to reject our client certificate.
///
/// Silence or application data within the window counts as acceptance; any
/// data read is returned so it can be replayed to the caller.
async fn await_client_auth_verdict<S>(
    stream: &mut TlsStream<S>,
    window: Duration,
    server_name: &str,
    auth: ClientAuthContext,
) -> Result<BytesMut, HandshakeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffered = BytesMut::with_capacity(4096);

    match timeout(window, stream.read_buf(&mut buffered)).await {
        Err(_) => {
            debug!(?window, "no client certificate rejection from broker");
            Ok(BytesMut::new())
        }
        Ok(Ok(0)) => Err(classify_closed(
            "broker closed the connection after the handshake".to_string(),
            auth,
        )),
        Ok(Ok(n)) => {
            debug!(bytes = n, "broker sent data after the handshake");
            Ok(buffered)
        }
        Ok(Err(e)) => Err(classify_io(&e, server_name, auth)),
    }
}

/// Build a rustls `ClientConfig` for one connection attempt.
fn build_client_config(
    identity: &TlsIdentityConfig,
    tracker: Arc<ClientAuthTracker>,
    provider: Arc<CryptoProvider>,
) -> Result<ClientConfig, TlsError> {
    let root_store = identity.trust_roots.root_store()?;

    let versions = match identity.min_protocol_version {
        TlsVersion::Tls12 => TLS12_AND_LATER,
        TlsVersion::Tls13 => TLS13_ONLY,
    };

    let client_config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|e| TlsError::Config(format!("unsupported protocol versions: {e}")))?
        .with_root_certificates(root_store)
        .with_client_cert_resolver(tracker);

    Ok(client_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        RecordingReporter, TestPki, TlsBrokerOptions, TlsTestBroker, TrackingTransport,
    };
    use crate::tls::identity::TrustRoots;
    use async_trait::async_trait;
    use tokio::net::{TcpListener, TcpStream};

    /// Dials `target` whatever address the connector asks for.
    struct FixedTransport {
        target: String,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        type Stream = TcpStream;

        async fn dial(&self, _address: &str) -> std::io::Result<TcpStream> {
            TcpStream::connect(&self.target).await
        }
    }

    #[test]
    fn test_build_client_config_system_roots() {
        let tracker = Arc::new(ClientAuthTracker::new(None));
        let config = build_client_config(&TlsIdentityConfig::default(), tracker, crypto_provider());
        assert!(config.is_ok());
    }

    #[test]
    fn test_build_client_config_custom_roots_with_identity() {
        let pki = TestPki::generate();
        let identity = pki.client_config();
        let certified = identity
            .local_identity
            .as_ref()
            .unwrap()
            .certified_key(&crypto_provider())
            .unwrap();
        let tracker = Arc::new(ClientAuthTracker::new(Some(certified)));

        let config = build_client_config(&identity, tracker, crypto_provider()).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_tracker_records_request() {
        let tracker = ClientAuthTracker::new(None);
        assert_eq!(tracker.context(), ClientAuthContext::default());

        assert!(tracker.resolve(&[], &[]).is_none());
        assert_eq!(
            tracker.context(),
            ClientAuthContext {
                requested: true,
                offered: false,
                key_unverified: false,
            }
        );
    }

    #[test]
    fn test_builder_settings() {
        let connector = SecureConnector::new()
            .with_handshake_timeout(Duration::from_secs(3))
            .with_client_auth_confirm_timeout(Duration::ZERO);
        assert_eq!(connector.handshake_timeout, Duration::from_secs(3));
        assert!(connector.client_auth_confirm_timeout.is_zero());
    }

    #[test]
    fn test_from_config_uses_timeouts() {
        let config = ConnectionConfig {
            bootstrap_servers: vec!["localhost:9093".to_string()],
            connection_timeout_ms: 1_500,
            handshake_timeout_ms: 2_500,
            client_auth_confirm_timeout_ms: 0,
            ..ConnectionConfig::default()
        };
        let connector = SecureConnector::from_config(&config);
        assert_eq!(connector.transport().connect_timeout(), Duration::from_millis(1_500));
        assert_eq!(connector.handshake_timeout, Duration::from_millis(2_500));
        assert!(connector.client_auth_confirm_timeout.is_zero());
    }

    #[tokio::test]
    async fn test_empty_server_name_falls_back_to_dial_address() {
        let pki = TestPki::generate();
        let reporter = Arc::new(RecordingReporter::default());
        let broker = TlsTestBroker::start(&pki, TlsBrokerOptions::default(), reporter.clone())
            .await
            .unwrap();
        let connector = SecureConnector::with_transport(FixedTransport {
            target: broker.address().to_string(),
        });

        let channel = connector
            .connect("localhost", Some(&pki.client_config()))
            .await
            .unwrap();
        assert_eq!(channel.server_name(), "localhost");
        assert!(reporter.failures().is_empty());
    }

    #[tokio::test]
    async fn test_underivable_server_name_still_dials() {
        let transport = TrackingTransport::new();
        let connector = SecureConnector::with_transport(transport.clone());

        let err = connector.connect(":9093", None).await;
        assert!(matches!(err, Err(ConnectError::Transport { .. })));
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_underivable_server_name_fails_after_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connector = SecureConnector::with_transport(FixedTransport {
            target: listener.local_addr().unwrap().to_string(),
        });

        let err = connector.connect(":9093", None).await.unwrap_err();
        assert_eq!(
            err.handshake_failure(),
            Some(&HandshakeFailure::MissingServerName)
        );
        assert_eq!(err.phase(), ConnectPhase::Handshaking);
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let connector = SecureConnector::with_transport(TrackingTransport::new());
        let config = TlsIdentityConfig {
            server_name: Some("not a hostname!".to_string()),
            ..TlsIdentityConfig::default()
        };

        let err = connector.connect("127.0.0.1:9", Some(&config)).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Config {
                source: TlsError::InvalidServerName { .. },
                ..
            }
        ));
        assert_eq!(connector.transport().dial_count(), 0);
    }

    #[tokio::test]
    async fn test_key_mismatch_fails_before_dialing() {
        let pki = TestPki::generate();
        let transport = TrackingTransport::new();
        let connector = SecureConnector::with_transport(transport.clone());

        let err = connector
            .connect("127.0.0.1:9", Some(&pki.client_config_with_wrong_key()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::LocalIdentity { .. }));
        assert_eq!(
            err.handshake_failure(),
            Some(&HandshakeFailure::LocalIdentityMismatch)
        );
        assert_eq!(err.phase(), ConnectPhase::Idle);
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_trust_roots() {
        let connector = SecureConnector::with_transport(TrackingTransport::new());
        let config = TlsIdentityConfig {
            trust_roots: TrustRoots::Custom(vec![vec![1u8, 2, 3].into()]),
            ..TlsIdentityConfig::default()
        };

        let err = connector.connect("localhost:9093", Some(&config)).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Config {
                source: TlsError::NoCertificates(_),
                ..
            }
        ));
    }
}
