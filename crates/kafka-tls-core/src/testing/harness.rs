//! Scenario runner for end-to-end handshake tests.
//!
//! Each scenario starts a [`TlsTestBroker`], connects to it once through a
//! [`TrackingTransport`] and records what happened on both sides. Broker-side
//! failures are collected when the scenario expects success and swallowed
//! when it expects rejection, so the same broker code serves both.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ConnectError, HandshakeFailure};
use crate::tls::{SecureConnector, TlsIdentityConfig};

use super::pki::TestPki;
use super::tls_broker::{TlsBrokerOptions, TlsTestBroker};
use super::transport::TrackingTransport;

const ECHO_PAYLOAD: &[u8] = b"ping";

/// Receives broker-side handshake failures.
pub trait FailureReporter: Send + Sync {
    fn report(&self, failure: String);
}

/// Keeps every reported failure.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    failures: Mutex<Vec<String>>,
}

impl RecordingReporter {
    /// Failures reported so far.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&self, failure: String) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}

/// Swallows every reported failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingReporter;

impl FailureReporter for DiscardingReporter {
    fn report(&self, _failure: String) {}
}

/// What a scenario should end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Secured,
    Rejected,
}

/// Which form of the broker address the client dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialAddress {
    /// `localhost:<port>`
    #[default]
    Localhost,
    /// `127.0.0.1:<port>`
    Ip,
}

/// One client/broker pairing.
#[derive(Debug, Clone)]
pub struct HandshakeScenario {
    pub name: String,
    pub expect: Expectation,
    pub broker: TlsBrokerOptions,
    pub client: Option<TlsIdentityConfig>,
    pub dial: DialAddress,
}

impl HandshakeScenario {
    #[must_use]
    pub fn new(name: impl Into<String>, expect: Expectation) -> Self {
        Self {
            name: name.into(),
            expect,
            broker: TlsBrokerOptions::default(),
            client: None,
            dial: DialAddress::default(),
        }
    }

    #[must_use]
    pub fn broker(mut self, options: TlsBrokerOptions) -> Self {
        self.broker = options;
        self
    }

    #[must_use]
    pub fn client(mut self, config: TlsIdentityConfig) -> Self {
        self.client = Some(config);
        self
    }

    #[must_use]
    pub fn dial(mut self, dial: DialAddress) -> Self {
        self.dial = dial;
        self
    }
}

/// What a scenario run observed.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub expect: Expectation,
    pub error: Option<ConnectError>,
    /// Whether the echo round trip matched, on success.
    pub echoed: bool,
    /// Failures the broker reported; always empty for rejected scenarios.
    pub broker_failures: Vec<String>,
    pub dials: usize,
    /// Streams still open after the channel (if any) was dropped.
    pub open_streams: usize,
}

impl ScenarioOutcome {
    /// The handshake failure reason, if the attempt failed in the handshake.
    #[must_use]
    pub fn handshake_failure(&self) -> Option<&HandshakeFailure> {
        self.error.as_ref().and_then(ConnectError::handshake_failure)
    }

    /// Everything that contradicts the expectation.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        match (self.expect, &self.error) {
            (Expectation::Secured, Some(e)) => {
                violations.push(format!("expected a secured channel, got: {e}"));
            }
            (Expectation::Secured, None) if !self.echoed => {
                violations.push("echo round trip did not match".to_string());
            }
            (Expectation::Rejected, None) => {
                violations.push("expected rejection, got a secured channel".to_string());
            }
            _ => {}
        }

        violations.extend(
            self.broker_failures
                .iter()
                .map(|failure| format!("broker reported: {failure}")),
        );

        if self.open_streams != 0 {
            violations.push(format!("{} stream(s) left open", self.open_streams));
        }

        violations
    }

    /// Panic with every violation listed.
    ///
    /// # Panics
    ///
    /// Panics if [`ScenarioOutcome::violations`] is non-empty.
    pub fn assert_expected(&self) {
        let violations = self.violations();
        assert!(
            violations.is_empty(),
            "scenario '{}' failed:\n  {}",
            self.name,
            violations.join("\n  ")
        );
    }
}

/// Run one scenario against a fresh broker.
///
/// # Panics
///
/// Panics if the broker cannot be started.
pub async fn run_scenario(pki: &TestPki, scenario: HandshakeScenario) -> ScenarioOutcome {
    let recording = Arc::new(RecordingReporter::default());
    let reporter: Arc<dyn FailureReporter> = match scenario.expect {
        Expectation::Secured => recording.clone(),
        Expectation::Rejected => Arc::new(DiscardingReporter),
    };

    let mut broker = TlsTestBroker::start(pki, scenario.broker, reporter)
        .await
        .expect("failed to start TLS test broker");
    let address = match scenario.dial {
        DialAddress::Localhost => broker.localhost_address(),
        DialAddress::Ip => broker.address().to_string(),
    };

    let transport = TrackingTransport::new();
    let connector = SecureConnector::with_transport(transport.clone())
        .with_handshake_timeout(Duration::from_secs(5))
        .with_client_auth_confirm_timeout(Duration::from_millis(500));

    let (error, echoed) = match connector.connect(&address, scenario.client.as_ref()).await {
        Ok(mut channel) => {
            let mut reply = [0u8; ECHO_PAYLOAD.len()];
            let echoed = channel.write_all(ECHO_PAYLOAD).await.is_ok()
                && channel.flush().await.is_ok()
                && channel.read_exact(&mut reply).await.is_ok()
                && reply == ECHO_PAYLOAD;
            (None, echoed)
        }
        Err(e) => (Some(e), false),
    };

    let outcome = ScenarioOutcome {
        name: scenario.name,
        expect: scenario.expect,
        error,
        echoed,
        broker_failures: recording.failures(),
        dials: transport.dial_count(),
        open_streams: transport.open_streams(),
    };

    broker.stop().await;
    outcome
}
