//! Domain error types for secure broker connections.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

use crate::tls::ConnectPhase;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// No bootstrap servers configured.
    #[error("bootstrap_servers must contain at least one broker address")]
    NoBootstrapServers,

    /// A broker address is empty.
    #[error("invalid address format: '{0}' (expected 'host:port')")]
    InvalidAddress(String),

    /// Only one half of the client identity was configured.
    #[error("cert_path and key_path must be set together (cert_path set: {cert}, key_path set: {key})")]
    IncompleteClientIdentity { cert: bool, key: bool },

    /// A timeout that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Errors raised while loading or applying TLS material.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Certificate file could not be read or parsed.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Private key file could not be read or parsed.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// The source contained no usable certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// The source contained no usable private key.
    #[error("no private key found in '{0}'")]
    NoPrivateKeys(String),

    /// The server name is not a valid DNS name or IP address.
    #[error("invalid server name '{name}': {message}")]
    InvalidServerName { name: String, message: String },

    /// TLS configuration rejected by rustls.
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Why a TLS handshake with a broker failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The broker's certificate chain does not lead to a configured trust root.
    #[error("broker certificate is not trusted: {0}")]
    PeerNotTrusted(String),

    /// The broker's certificate does not cover the resolved server name.
    #[error("broker certificate is not valid for server name '{0}'")]
    NameMismatch(String),

    /// No protocol version at or above the configured floor could be agreed.
    #[error("broker could not negotiate the minimum protocol version: {0}")]
    ProtocolVersion(String),

    /// The broker requires a client certificate but none was configured.
    #[error("client authentication required but not offered")]
    ClientAuthNotOffered,

    /// The local private key does not belong to the local certificate.
    #[error("client private key does not match client certificate")]
    LocalIdentityMismatch,

    /// The broker rejected the client certificate.
    #[error("client certificate rejected by broker: {0}")]
    LocalIdentityNotTrusted(String),

    /// Neither the configuration nor the broker address yields a name to
    /// verify the broker certificate against.
    #[error("no server name could be derived from the broker address and none was configured")]
    MissingServerName,

    /// The handshake did not complete in time.
    #[error("TLS handshake timed out")]
    Timeout,

    /// Any other handshake error reported by the TLS library.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by a connection attempt.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The raw transport connection could not be established.
    #[error("failed to connect to broker {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The transport was established but the TLS handshake failed.
    #[error("TLS handshake with broker {address} (server name '{server_name}') failed: {reason}")]
    Handshake {
        address: String,
        server_name: String,
        reason: HandshakeFailure,
    },

    /// The local client identity was refused before dialing.
    #[error("client identity for broker {address} is unusable: {reason}")]
    LocalIdentity {
        address: String,
        reason: HandshakeFailure,
    },

    /// TLS material or parameters are unusable for this attempt.
    #[error("TLS configuration error for broker {address}: {source}")]
    Config {
        address: String,
        #[source]
        source: TlsError,
    },
}

impl ConnectError {
    /// The phase the attempt was in when it failed.
    #[must_use]
    pub fn phase(&self) -> ConnectPhase {
        match self {
            Self::Config { .. } | Self::LocalIdentity { .. } => ConnectPhase::Idle,
            Self::Transport { .. } => ConnectPhase::Dialing,
            Self::Handshake { .. } => ConnectPhase::Handshaking,
        }
    }

    /// The handshake failure reason, including identity checks made before dialing.
    #[must_use]
    pub fn handshake_failure(&self) -> Option<&HandshakeFailure> {
        match self {
            Self::Handshake { reason, .. } | Self::LocalIdentity { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Check if this is a transport-level failure.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS material operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Result type alias for connection attempts.
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;
