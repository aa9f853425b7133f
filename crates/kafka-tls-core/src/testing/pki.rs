//! Throwaway certificate authority, broker and client certificates.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;

use crate::tls::{LocalIdentity, TlsIdentityConfig, TrustRoots};

/// A CA with one broker ("host") certificate and one client certificate.
///
/// The host certificate covers `localhost` and `127.0.0.1`.
pub struct TestPki {
    ca_cert: Certificate,
    host_cert: Certificate,
    host_key: KeyPair,
    client_cert: Certificate,
    client_key: KeyPair,
}

impl TestPki {
    /// Generate a fresh PKI.
    ///
    /// # Panics
    ///
    /// Panics if key or certificate generation fails.
    #[must_use]
    pub fn generate() -> Self {
        Self::try_generate("Kafka Test CA").expect("failed to generate test PKI")
    }

    /// Generate a fresh PKI whose CA uses the given common name.
    ///
    /// # Errors
    ///
    /// Returns an error if key or certificate generation fails.
    pub fn try_generate(ca_name: &str) -> Result<Self, rcgen::Error> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.distinguished_name.push(DnType::CommonName, ca_name);
        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let mut host_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
        host_params.distinguished_name.push(DnType::CommonName, "host");
        host_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let host_key = KeyPair::generate()?;
        let host_cert = host_params.signed_by(&host_key, &ca_cert, &ca_key)?;

        let mut client_params = CertificateParams::new(Vec::<String>::new())?;
        client_params.distinguished_name.push(DnType::CommonName, "client");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_key = KeyPair::generate()?;
        let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

        Ok(Self {
            ca_cert,
            host_cert,
            host_key,
            client_cert,
            client_key,
        })
    }

    /// The CA certificate in PEM form.
    #[must_use]
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// The CA certificate in DER form.
    #[must_use]
    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// A root store holding only this CA.
    #[must_use]
    pub fn ca_root_store(&self) -> RootCertStore {
        let mut store = RootCertStore::empty();
        store.add_parsable_certificates([self.ca_der()]);
        store
    }

    /// The broker certificate in PEM form.
    #[must_use]
    pub fn host_cert_pem(&self) -> String {
        self.host_cert.pem()
    }

    /// The broker private key in PEM form.
    #[must_use]
    pub fn host_key_pem(&self) -> String {
        self.host_key.serialize_pem()
    }

    /// The broker certificate chain.
    #[must_use]
    pub fn host_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.host_cert.der().clone()]
    }

    /// The broker private key.
    #[must_use]
    pub fn host_key(&self) -> PrivateKeyDer<'static> {
        pkcs8(&self.host_key)
    }

    /// The client certificate in PEM form.
    #[must_use]
    pub fn client_cert_pem(&self) -> String {
        self.client_cert.pem()
    }

    /// The client private key in PEM form.
    #[must_use]
    pub fn client_key_pem(&self) -> String {
        self.client_key.serialize_pem()
    }

    /// The client certificate with its own key.
    #[must_use]
    pub fn client_identity(&self) -> LocalIdentity {
        LocalIdentity::new(vec![self.client_cert.der().clone()], pkcs8(&self.client_key))
    }

    /// Trust this CA and present the client certificate.
    #[must_use]
    pub fn client_config(&self) -> TlsIdentityConfig {
        TlsIdentityConfig {
            trust_roots: TrustRoots::Custom(vec![self.ca_der()]),
            local_identity: Some(self.client_identity()),
            ..TlsIdentityConfig::default()
        }
    }

    /// Trust this CA but offer no client certificate.
    #[must_use]
    pub fn client_config_without_identity(&self) -> TlsIdentityConfig {
        TlsIdentityConfig {
            trust_roots: TrustRoots::Custom(vec![self.ca_der()]),
            ..TlsIdentityConfig::default()
        }
    }

    /// The client certificate paired with the broker's private key.
    #[must_use]
    pub fn client_config_with_wrong_key(&self) -> TlsIdentityConfig {
        TlsIdentityConfig {
            local_identity: Some(LocalIdentity::new(
                vec![self.client_cert.der().clone()],
                pkcs8(&self.host_key),
            )),
            ..self.client_config()
        }
    }

    /// Present the broker's own certificate and key as the client identity.
    #[must_use]
    pub fn client_config_with_host_identity(&self) -> TlsIdentityConfig {
        TlsIdentityConfig {
            local_identity: Some(LocalIdentity::new(self.host_chain(), self.host_key())),
            ..self.client_config()
        }
    }

    /// The broker certificate paired with the client's private key.
    #[must_use]
    pub fn client_config_with_swapped_cert(&self) -> TlsIdentityConfig {
        TlsIdentityConfig {
            local_identity: Some(LocalIdentity::new(
                self.host_chain(),
                pkcs8(&self.client_key),
            )),
            ..self.client_config()
        }
    }
}

fn pkcs8(key: &KeyPair) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()))
}
