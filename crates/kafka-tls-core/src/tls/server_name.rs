//! Server name resolution for broker TLS handshakes.
//!
//! Decides which identity the broker certificate is verified against: an
//! explicit override when one is configured, otherwise the host part of the
//! broker address.

use std::borrow::Cow;

use super::identity::TlsIdentityConfig;

/// Per-attempt TLS configuration with the server name filled in.
///
/// Built fresh for every connection attempt by [`resolve`] and dropped once
/// the handshake completes or fails, so one broker's resolved name never
/// reaches another broker's handshake.
#[derive(Debug, Clone)]
pub struct EffectiveTlsConfig<'a> {
    server_name: String,
    identity: Cow<'a, TlsIdentityConfig>,
}

impl<'a> EffectiveTlsConfig<'a> {
    /// The name the broker certificate must match.
    ///
    /// Empty when neither an override nor a host could be derived.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The caller's configuration, or the default when none was supplied.
    #[must_use]
    pub fn identity(&self) -> &TlsIdentityConfig {
        &self.identity
    }

    /// Whether the identity was borrowed from the caller rather than defaulted.
    #[must_use]
    pub fn is_borrowed(&self) -> bool {
        matches!(self.identity, Cow::Borrowed(_))
    }
}

/// Resolve the effective TLS configuration for a connection to `address`.
///
/// A non-empty `server_name` in `config` always wins. Otherwise the host part
/// of `address` is used; when the address has no port, is malformed or has an
/// empty host, the server name is left empty.
///
/// ```
/// use kafka_tls_core::tls::resolve;
///
/// let effective = resolve("kafka-1.example.com:9093", None);
/// assert_eq!(effective.server_name(), "kafka-1.example.com");
///
/// let effective = resolve("host-no-port", None);
/// assert_eq!(effective.server_name(), "");
/// ```
#[must_use]
pub fn resolve<'a>(address: &str, config: Option<&'a TlsIdentityConfig>) -> EffectiveTlsConfig<'a> {
    let identity = match config {
        Some(config) => Cow::Borrowed(config),
        None => Cow::Owned(TlsIdentityConfig::default()),
    };

    let server_name = match identity.server_name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => split_host_port(address)
            .map(|(host, _port)| host.to_string())
            .unwrap_or_default(),
    };

    EffectiveTlsConfig {
        server_name,
        identity,
    }
}

/// Split `host:port` or `[host]:port` into its parts.
///
/// Returns `None` when there is no port separator, when the port is not
/// numeric, or when an unbracketed host itself contains a colon.
/// The port may be empty, as in `"kafka:"`.
pub(crate) fn split_host_port(address: &str) -> Option<(&str, &str)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        (&rest[..end], port)
    } else {
        let colon = address.rfind(':')?;
        let host = &address[..colon];
        if host.contains(':') || host.contains('[') || host.contains(']') {
            return None;
        }
        (host, &address[colon + 1..])
    };

    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some((host, port))
}

/// The name the TLS layer verifies against when [`resolve`] leaves it empty:
/// everything before the last `:` of the dialed address, or the whole address.
pub(crate) fn fallback_server_name(address: &str) -> &str {
    address.rfind(':').map_or(address, |colon| &address[..colon])
}
