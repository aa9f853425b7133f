//! Test utilities for secure broker connections.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`TestPki`] - A throwaway CA with broker and client certificates
//! - [`TlsTestBroker`] - An in-process TLS broker that echoes application bytes
//! - [`TrackingTransport`] - A TCP transport that counts open streams
//! - [`run_scenario`] - Connect once and check the outcome against an expectation
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_tls_core::testing::{run_scenario, Expectation, HandshakeScenario, TestPki};
//!
//! #[tokio::test]
//! async fn test_mutual_tls() {
//!     let pki = TestPki::generate();
//!     let scenario = HandshakeScenario::new("mutual", Expectation::Secured)
//!         .client(pki.client_config());
//!
//!     run_scenario(&pki, scenario).await.assert_expected();
//! }
//! ```

pub mod harness;
pub mod pki;
pub mod tls_broker;
pub mod transport;

pub use harness::{
    run_scenario, DialAddress, DiscardingReporter, Expectation, FailureReporter,
    HandshakeScenario, RecordingReporter, ScenarioOutcome,
};
pub use pki::TestPki;
pub use tls_broker::{AcceptedSession, ClientAuthMode, TlsBrokerOptions, TlsTestBroker};
pub use transport::{TrackedStream, TrackingTransport};
