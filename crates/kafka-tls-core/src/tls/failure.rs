//! Mapping TLS library errors onto [`HandshakeFailure`] reasons.

use std::io;

use rustls::{AlertDescription, CertificateError};

use crate::error::HandshakeFailure;

/// What the client knew about client authentication when the error surfaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ClientAuthContext {
    /// The broker sent a CertificateRequest.
    pub requested: bool,
    /// A local identity was configured.
    pub offered: bool,
    /// The local key could not be compared against its certificate before dialing.
    pub key_unverified: bool,
}

/// Classify an I/O error raised during or right after the handshake.
pub(crate) fn classify_io(
    err: &io::Error,
    server_name: &str,
    auth: ClientAuthContext,
) -> HandshakeFailure {
    match err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(tls_err) => classify(tls_err, server_name, auth),
        None => classify_closed(err.to_string(), auth),
    }
}

/// Classify a rustls error.
pub(crate) fn classify(
    err: &rustls::Error,
    server_name: &str,
    auth: ClientAuthContext,
) -> HandshakeFailure {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => classify_certificate(cert_err, server_name),
        rustls::Error::AlertReceived(alert) => classify_alert(*alert, auth),
        rustls::Error::PeerIncompatible(incompatible) => {
            HandshakeFailure::ProtocolVersion(format!("{incompatible:?}"))
        }
        rustls::Error::InconsistentKeys(_) => HandshakeFailure::LocalIdentityMismatch,
        other => HandshakeFailure::Other(other.to_string()),
    }
}

/// Classify the broker dropping the connection without a TLS alert.
pub(crate) fn classify_closed(detail: String, auth: ClientAuthContext) -> HandshakeFailure {
    match (auth.requested, auth.offered) {
        (true, false) => HandshakeFailure::ClientAuthNotOffered,
        (true, true) => HandshakeFailure::LocalIdentityNotTrusted(detail),
        (false, _) => HandshakeFailure::Other(detail),
    }
}

fn classify_certificate(err: &CertificateError, server_name: &str) -> HandshakeFailure {
    // Newer rustls releases report name mismatches through a context-carrying
    // variant of `NotValidForName`.
    if matches!(err, CertificateError::NotValidForName)
        || format!("{err:?}").starts_with("NotValidForName")
    {
        return HandshakeFailure::NameMismatch(server_name.to_string());
    }

    HandshakeFailure::PeerNotTrusted(err.to_string())
}

fn classify_alert(alert: AlertDescription, auth: ClientAuthContext) -> HandshakeFailure {
    if alert == AlertDescription::ProtocolVersion {
        return HandshakeFailure::ProtocolVersion(format!("broker sent {alert:?} alert"));
    }

    if auth.requested && !auth.offered {
        return HandshakeFailure::ClientAuthNotOffered;
    }

    match alert {
        AlertDescription::CertificateRequired => HandshakeFailure::ClientAuthNotOffered,
        AlertDescription::DecryptError if auth.offered && auth.key_unverified => {
            HandshakeFailure::LocalIdentityMismatch
        }
        AlertDescription::DecryptError
        | AlertDescription::BadCertificate
        | AlertDescription::UnsupportedCertificate
        | AlertDescription::CertificateRevoked
        | AlertDescription::CertificateExpired
        | AlertDescription::CertificateUnknown
        | AlertDescription::UnknownCA
        | AlertDescription::AccessDenied
            if auth.offered =>
        {
            HandshakeFailure::LocalIdentityNotTrusted(format!("broker sent {alert:?} alert"))
        }
        other => HandshakeFailure::Other(format!("broker sent {other:?} alert")),
    }
}
