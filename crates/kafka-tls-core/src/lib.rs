//! Kafka Secure Broker Connection Library
//!
//! This library decides which TLS identity a Kafka broker must prove and
//! establishes mutually authenticated TLS connections to brokers before any
//! Kafka protocol traffic flows.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`transport`] - Raw byte-stream transports (TCP)
//! - [`tls`] - Server name resolution and the secure connector
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_tls_core::config::ConnectionConfig;
//! use kafka_tls_core::tls::SecureConnector;
//!
//! let config = ConnectionConfig::from_file("connection.yaml")?;
//! let identity = config.tls_identity()?;
//! let connector = SecureConnector::from_config(&config);
//!
//! for broker in &config.bootstrap_servers {
//!     let channel = connector.connect(broker, Some(&identity)).await?;
//!     // hand the channel to the Kafka protocol layer
//! }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod tls;
pub mod transport;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{BrokerTlsConfig, ConnectionConfig, TlsVersion};
pub use error::{ConfigError, ConnectError, ConnectResult, HandshakeFailure, TlsError};
pub use tls::{resolve, SecureChannel, SecureConnector, TlsIdentityConfig};
pub use transport::{TcpTransport, Transport};
