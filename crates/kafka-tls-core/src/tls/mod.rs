//! TLS support for Kafka broker connections.
//!
//! # Features
//!
//! - **Server name resolution** (`server_name` module): which identity the
//!   broker certificate is verified against
//! - **Identity** (`identity` module): trust roots, client certificate and key
//! - **Client TLS** (`client` module): dial a broker and run a mutually
//!   authenticated handshake
//!
//! # Usage
//!
//! ```rust,ignore
//! use kafka_tls_core::config::BrokerTlsConfig;
//! use kafka_tls_core::tls::SecureConnector;
//!
//! let identity = BrokerTlsConfig { ca_cert_path: ..., cert_path: ..., key_path: ..., ..Default::default() }.load()?;
//! let connector = SecureConnector::new();
//! let channel = connector.connect("kafka.example.com:9093", Some(&identity)).await?;
//! ```

pub mod client;
mod failure;
pub mod identity;
pub mod server_name;
pub mod stream;

pub use client::{ConnectPhase, SecureConnector};
pub use identity::{LocalIdentity, TlsIdentityConfig, TrustRoots};
pub use server_name::{resolve, EffectiveTlsConfig};
pub use stream::SecureChannel;
