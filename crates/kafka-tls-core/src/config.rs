//! Configuration types for secure broker connections.
//!
//! Configuration is loaded from YAML files and validated before use.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult, TlsResult};
use crate::tls::identity::{load_certificates, LocalIdentity, TlsIdentityConfig, TrustRoots};

/// Root configuration for broker connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Broker addresses, e.g. "kafka-1.example.com:9093".
    pub bootstrap_servers: Vec<String>,

    /// Dial timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// TLS handshake timeout in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long to wait for the broker's verdict on the client certificate
    /// after a TLS 1.3 handshake in which it was requested.
    /// Kafka brokers never send first, so an accepted certificate costs the
    /// full window on every such connect.
    /// Set to 0 to accept the handshake as soon as it completes.
    #[serde(default = "default_client_auth_confirm_timeout_ms")]
    pub client_auth_confirm_timeout_ms: u64,

    /// TLS configuration. If not set, system roots and no client certificate are used.
    #[serde(default)]
    pub tls: Option<BrokerTlsConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Minimum TLS protocol version accepted for broker connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize)]
pub enum TlsVersion {
    /// TLS 1.2 and later.
    #[default]
    #[serde(rename = "TLSv1.2")]
    Tls12,
    /// TLS 1.3 only.
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl TlsVersion {
    /// Get the protocol name as used in configuration and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tls12 => "TLSv1.2",
            Self::Tls13 => "TLSv1.3",
        }
    }
}

impl std::str::FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TLSV1.2" | "1.2" | "TLS12" => Ok(Self::Tls12),
            "TLSV1.3" | "1.3" | "TLS13" => Ok(Self::Tls13),
            other => Err(format!("unsupported TLS version '{other}' (expected TLSv1.2 or TLSv1.3)")),
        }
    }
}

/// TLS configuration for broker connections.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrokerTlsConfig {
    /// Explicit server name to verify the broker certificate against.
    /// Overrides the host part of the broker address.
    /// Supports environment variable expansion: "${KAFKA_TLS_SERVER_NAME}"
    #[serde(default)]
    pub server_name: Option<String>,

    /// Path to CA certificate file (PEM format) for verifying broker certificates.
    /// If not set, uses the bundled Mozilla root certificates.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Path to client certificate file (PEM format) for mTLS authentication.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Path to client private key file (PEM format) for mTLS authentication.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Lowest protocol version the client will negotiate.
    #[serde(default)]
    pub min_version: TlsVersion,
}

impl BrokerTlsConfig {
    /// Get the server name override with environment variables expanded.
    ///
    /// An override that expands to an empty string counts as unset.
    #[must_use]
    pub fn server_name(&self) -> Option<String> {
        self.server_name
            .as_deref()
            .map(expand_env_vars)
            .filter(|name| !name.is_empty())
    }

    /// Get the CA certificate path with environment variables expanded.
    #[must_use]
    pub fn ca_cert_path(&self) -> Option<PathBuf> {
        self.ca_cert_path.as_deref().map(expand_path)
    }

    /// Get the client certificate path with environment variables expanded.
    #[must_use]
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.cert_path.as_deref().map(expand_path)
    }

    /// Get the client key path with environment variables expanded.
    #[must_use]
    pub fn key_path(&self) -> Option<PathBuf> {
        self.key_path.as_deref().map(expand_path)
    }

    /// Validate the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of `cert_path` and `key_path` is set.
    pub fn validate(&self) -> ConfigResult<()> {
        match (&self.cert_path, &self.key_path) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            (cert, key) => Err(ConfigError::IncompleteClientIdentity {
                cert: cert.is_some(),
                key: key.is_some(),
            }),
        }
    }

    /// Load the referenced certificate material into a [`TlsIdentityConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if any referenced file cannot be read or holds no
    /// usable certificates or keys.
    pub fn load(&self) -> TlsResult<TlsIdentityConfig> {
        let trust_roots = match self.ca_cert_path() {
            Some(ca_path) => TrustRoots::Custom(load_certificates(&ca_path)?),
            None => TrustRoots::System,
        };

        let local_identity = match (self.cert_path(), self.key_path()) {
            (Some(cert_path), Some(key_path)) => {
                Some(LocalIdentity::from_files(&cert_path, &key_path)?)
            }
            _ => None,
        };

        Ok(TlsIdentityConfig {
            server_name: self.server_name(),
            trust_roots,
            local_identity,
            min_protocol_version: self.min_version,
        })
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_client_auth_confirm_timeout_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: Vec::new(),
            connection_timeout_ms: default_connection_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            client_auth_confirm_timeout_ms: default_client_auth_confirm_timeout_ms(),
            tls: None,
            logging: LoggingConfig::default(),
        }
    }
}

// Configuration loading and validation

impl ConnectionConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `bootstrap_servers` is empty or contains an empty address
    /// - `connection_timeout_ms` or `handshake_timeout_ms` is zero
    /// - the TLS section configures only half of a client identity
    pub fn validate(&self) -> ConfigResult<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::NoBootstrapServers);
        }

        if let Some(address) = self.bootstrap_servers.iter().find(|a| a.trim().is_empty()) {
            return Err(ConfigError::InvalidAddress(address.clone()));
        }

        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connection_timeout_ms"));
        }

        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("handshake_timeout_ms"));
        }

        if let Some(tls) = &self.tls {
            tls.validate()?;
        }

        Ok(())
    }

    /// Dial timeout as a [`Duration`].
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Client certificate verdict window as a [`Duration`].
    #[must_use]
    pub fn client_auth_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.client_auth_confirm_timeout_ms)
    }

    /// Load the TLS identity for connections, falling back to system roots
    /// and no client certificate when no TLS section is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if referenced certificate or key files cannot be loaded.
    pub fn tls_identity(&self) -> TlsResult<TlsIdentityConfig> {
        match &self.tls {
            Some(tls) => tls.load(),
            None => Ok(TlsIdentityConfig::default()),
        }
    }
}
