//! TLS identity configuration and certificate material loading.

use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, RootCertStore};
use tracing::{debug, warn};

use crate::config::TlsVersion;
use crate::error::{HandshakeFailure, TlsError, TlsResult};

/// Certificate authorities accepted when validating a broker's certificate.
#[derive(Debug, Clone, Default)]
pub enum TrustRoots {
    /// The bundled Mozilla root certificates.
    #[default]
    System,
    /// Exactly these authorities. An empty list trusts no broker.
    Custom(Vec<CertificateDer<'static>>),
}

impl TrustRoots {
    /// Trust the authorities in a PEM bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle holds no certificates.
    pub fn from_pem(pem: &str) -> TlsResult<Self> {
        let certs = parse_certificates(&mut pem.as_bytes(), "<pem>")?;
        Ok(Self::Custom(certs))
    }

    /// Build the rustls root store for these authorities.
    pub(crate) fn root_store(&self) -> TlsResult<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        match self {
            Self::System => {
                debug!("using system root certificates");
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            Self::Custom(certs) => {
                let (added, ignored) = root_store.add_parsable_certificates(certs.iter().cloned());
                debug!(added, ignored, "added CA certificates to trust store");

                if added == 0 && !certs.is_empty() {
                    return Err(TlsError::NoCertificates("configured trust roots".to_string()));
                }
            }
        }

        Ok(root_store)
    }
}

/// Certificate chain and private key presented for client authentication.
pub struct LocalIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl LocalIdentity {
    /// Create an identity from DER material. The leaf certificate comes first.
    #[must_use]
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    /// Load an identity from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or holds no usable material.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> TlsResult<Self> {
        debug!("loading client certificate for mTLS");
        Ok(Self::new(
            load_certificates(cert_path)?,
            load_private_key(key_path)?,
        ))
    }

    /// Load an identity from PEM strings.
    ///
    /// # Errors
    ///
    /// Returns an error if either string holds no usable material.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> TlsResult<Self> {
        Ok(Self::new(
            parse_certificates(&mut cert_pem.as_bytes(), "<pem>")?,
            parse_private_key(&mut key_pem.as_bytes(), "<pem>")?,
        ))
    }

    /// The certificate chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Pair the chain with a signing key, refusing a key that does not belong
    /// to the leaf certificate.
    pub(crate) fn certified_key(
        &self,
        provider: &CryptoProvider,
    ) -> Result<CheckedIdentity, HandshakeFailure> {
        let signing_key = provider
            .key_provider
            .load_private_key(self.key.clone_key())
            .map_err(|e| HandshakeFailure::Other(format!("unusable client private key: {e}")))?;

        let certified = CertifiedKey::new(self.chain.clone(), signing_key);
        match certified.keys_match() {
            Ok(()) => Ok(CheckedIdentity {
                certified: Arc::new(certified),
                key_unverified: false,
            }),
            // The key type cannot report its public half; let the broker decide.
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
                Ok(CheckedIdentity {
                    certified: Arc::new(certified),
                    key_unverified: true,
                })
            }
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
                Err(HandshakeFailure::LocalIdentityMismatch)
            }
            Err(e) => Err(HandshakeFailure::Other(format!(
                "unusable client certificate: {e}"
            ))),
        }
    }
}

/// A client identity whose key has been loaded for signing.
#[derive(Debug)]
pub(crate) struct CheckedIdentity {
    pub certified: Arc<CertifiedKey>,
    /// `keys_match` could not compare the key with the leaf certificate.
    pub key_unverified: bool,
}

impl Clone for LocalIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("chain_len", &self.chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// TLS settings for connecting to a broker.
///
/// Owned by the caller and only borrowed for the duration of one connection
/// attempt. To rotate trust roots or the client identity, build a new value.
#[derive(Debug, Clone, Default)]
pub struct TlsIdentityConfig {
    /// Explicit name to verify the broker certificate against.
    /// `None` or an empty string means "derive from the broker address".
    pub server_name: Option<String>,

    /// Authorities accepted for the broker certificate chain.
    pub trust_roots: TrustRoots,

    /// Identity presented when the broker requests a client certificate.
    pub local_identity: Option<LocalIdentity>,

    /// Lowest protocol version to negotiate.
    pub min_protocol_version: TlsVersion,
}

/// Load certificates from a PEM file.
pub(crate) fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let certs = parse_certificates(&mut BufReader::new(file), &path.display().to_string())?;
    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load a private key from a PEM file.
pub(crate) fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    parse_private_key(&mut BufReader::new(file), &path.display().to_string())
}

fn parse_certificates(
    reader: &mut dyn BufRead,
    source: &str,
) -> TlsResult<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, source, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(source.to_string()));
    }

    Ok(certs)
}

fn parse_private_key(reader: &mut dyn BufRead, source: &str) -> TlsResult<PrivateKeyDer<'static>> {
    // Try to read any type of private key (RSA, PKCS8, EC)
    loop {
        match rustls_pemfile::read_one(reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                debug!(source, "loaded PKCS#1 RSA private key");
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                debug!(source, "loaded PKCS#8 private key");
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                debug!(source, "loaded SEC1 EC private key");
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(TlsError::PrivateKeyLoad {
                    path: source.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(TlsError::NoPrivateKeys(source.to_string()))
}
