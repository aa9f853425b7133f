//! End-to-end mutual TLS tests against an in-process broker.
//!
//! Every scenario dials a real localhost socket. Failing scenarios also check
//! that no raw stream stays open once `connect` has returned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kafka_tls_core::testing::{
    run_scenario, ClientAuthMode, DialAddress, DiscardingReporter, Expectation,
    HandshakeScenario, RecordingReporter, TestPki, TlsBrokerOptions, TlsTestBroker,
    TrackingTransport,
};
use kafka_tls_core::tls::{TlsIdentityConfig, TrustRoots};
use kafka_tls_core::{ConnectError, HandshakeFailure, SecureConnector, TlsVersion};
use rustls::ProtocolVersion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// =============================================================================
// Certificate scenarios
// =============================================================================

/// Valid mutual TLS: broker requires client auth, client trusts the CA and
/// presents a certificate issued by it.
#[tokio::test]
async fn test_valid_mutual_tls() {
    let pki = TestPki::generate();
    let scenario =
        HandshakeScenario::new("valid mutual TLS", Expectation::Secured).client(pki.client_config());

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert!(outcome.echoed);
}

/// Same pairing over TLS 1.2, where the broker judges the client certificate
/// inside the handshake.
#[tokio::test]
async fn test_valid_mutual_tls12() {
    let pki = TestPki::generate();
    let scenario = HandshakeScenario::new("valid mutual TLS 1.2", Expectation::Secured)
        .broker(TlsBrokerOptions::default().tls12_only())
        .client(pki.client_config());

    run_scenario(&pki, scenario).await.assert_expected();
}

/// Dialing by IP verifies the broker certificate against its IP SAN.
#[tokio::test]
async fn test_valid_mutual_tls_by_ip() {
    let pki = TestPki::generate();
    let scenario = HandshakeScenario::new("mutual TLS by IP", Expectation::Secured)
        .client(pki.client_config())
        .dial(DialAddress::Ip);

    run_scenario(&pki, scenario).await.assert_expected();
}

/// System roots only: the test CA is not among them.
#[tokio::test]
async fn test_system_roots_do_not_trust_private_ca() {
    let pki = TestPki::generate();
    let client = TlsIdentityConfig {
        trust_roots: TrustRoots::System,
        ..pki.client_config()
    };
    let scenario = HandshakeScenario::new("system roots", Expectation::Rejected).client(client);

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert!(matches!(
        outcome.handshake_failure(),
        Some(HandshakeFailure::PeerNotTrusted(_))
    ));
}

/// Client certificate paired with another identity's key.
#[tokio::test]
async fn test_certificate_key_mismatch() {
    let pki = TestPki::generate();
    let scenario = HandshakeScenario::new("cert/key mismatch", Expectation::Rejected)
        .client(pki.client_config_with_wrong_key());

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert_eq!(
        outcome.handshake_failure(),
        Some(&HandshakeFailure::LocalIdentityMismatch)
    );
    assert_eq!(outcome.dials, 0);
}

/// Broker certificate swapped in for the client certificate.
#[tokio::test]
async fn test_swapped_certificate() {
    let pki = TestPki::generate();
    let scenario = HandshakeScenario::new("swapped cert", Expectation::Rejected)
        .client(pki.client_config_with_swapped_cert());

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert_eq!(
        outcome.handshake_failure(),
        Some(&HandshakeFailure::LocalIdentityMismatch)
    );
}

/// The broker's own certificate and key presented as a client identity lack
/// the client-auth usage.
#[tokio::test]
async fn test_server_identity_rejected_as_client() {
    let pki = TestPki::generate();
    let scenario = HandshakeScenario::new("host identity as client", Expectation::Rejected)
        .client(pki.client_config_with_host_identity());

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert!(matches!(
        outcome.handshake_failure(),
        Some(HandshakeFailure::LocalIdentityNotTrusted(_))
    ));
}

/// A client certificate from an unrelated CA whose name collides with the
/// broker's CA: the broker fails the signature check, not the issuer lookup.
#[tokio::test]
async fn test_client_certificate_from_same_named_foreign_ca() {
    let pki = TestPki::generate();
    let foreign = TestPki::generate();
    assert_foreign_identity_not_trusted(&pki, &foreign).await;
}

/// A client certificate from an unrelated, differently named CA.
#[tokio::test]
async fn test_client_certificate_from_foreign_ca() {
    let pki = TestPki::generate();
    let foreign = TestPki::try_generate("Foreign CA").unwrap();
    assert_foreign_identity_not_trusted(&pki, &foreign).await;
}

async fn assert_foreign_identity_not_trusted(pki: &TestPki, foreign: &TestPki) {
    let client = TlsIdentityConfig {
        local_identity: Some(foreign.client_identity()),
        ..pki.client_config()
    };

    for options in [TlsBrokerOptions::default(), TlsBrokerOptions::default().tls12_only()] {
        let scenario = HandshakeScenario::new("foreign client cert", Expectation::Rejected)
            .broker(options)
            .client(client.clone());

        let outcome = run_scenario(pki, scenario).await;
        outcome.assert_expected();
        assert!(
            matches!(
                outcome.handshake_failure(),
                Some(HandshakeFailure::LocalIdentityNotTrusted(_))
            ),
            "unexpected failure: {:?}",
            outcome.error
        );
    }
}

/// An empty trust root set cannot validate any broker.
#[tokio::test]
async fn test_no_trust_roots() {
    let pki = TestPki::generate();
    let client = TlsIdentityConfig {
        trust_roots: TrustRoots::Custom(Vec::new()),
        ..pki.client_config()
    };
    let scenario = HandshakeScenario::new("no trust roots", Expectation::Rejected).client(client);

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert!(matches!(
        outcome.handshake_failure(),
        Some(HandshakeFailure::PeerNotTrusted(_))
    ));
}

/// Trusting the CA without a client certificate.
#[tokio::test]
async fn test_client_auth_not_offered() {
    let pki = TestPki::generate();

    for options in [TlsBrokerOptions::default(), TlsBrokerOptions::default().tls12_only()] {
        let scenario = HandshakeScenario::new("no client identity", Expectation::Rejected)
            .broker(options)
            .client(pki.client_config_without_identity());

        let outcome = run_scenario(&pki, scenario).await;
        outcome.assert_expected();
        assert_eq!(
            outcome.handshake_failure(),
            Some(&HandshakeFailure::ClientAuthNotOffered)
        );
        let err = outcome.error.as_ref().unwrap();
        assert!(err
            .to_string()
            .contains("client authentication required but not offered"));
    }
}

/// Without client authentication on the broker, no identity is needed.
#[tokio::test]
async fn test_server_only_tls() {
    let pki = TestPki::generate();
    let scenario = HandshakeScenario::new("server-only TLS", Expectation::Secured)
        .broker(TlsBrokerOptions::default().client_auth(ClientAuthMode::None))
        .client(pki.client_config_without_identity());

    run_scenario(&pki, scenario).await.assert_expected();
}

/// An explicit server name that the broker certificate does not cover.
#[tokio::test]
async fn test_server_name_mismatch() {
    let pki = TestPki::generate();
    let client = TlsIdentityConfig {
        server_name: Some("kafka.other.example".to_string()),
        ..pki.client_config()
    };
    let scenario = HandshakeScenario::new("name mismatch", Expectation::Rejected)
        .client(client)
        .dial(DialAddress::Ip);

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert_eq!(
        outcome.handshake_failure(),
        Some(&HandshakeFailure::NameMismatch("kafka.other.example".to_string()))
    );
}

/// An explicit server name overrides the dialed host.
#[tokio::test]
async fn test_server_name_override() {
    let pki = TestPki::generate();
    let client = TlsIdentityConfig {
        server_name: Some("localhost".to_string()),
        ..pki.client_config()
    };
    let scenario = HandshakeScenario::new("name override", Expectation::Secured)
        .client(client)
        .dial(DialAddress::Ip);

    run_scenario(&pki, scenario).await.assert_expected();
}

/// A TLS 1.3 floor against a TLS 1.2-only broker.
#[tokio::test]
async fn test_protocol_version_floor() {
    let pki = TestPki::generate();
    let client = TlsIdentityConfig {
        min_protocol_version: TlsVersion::Tls13,
        ..pki.client_config()
    };
    let scenario = HandshakeScenario::new("protocol floor", Expectation::Rejected)
        .broker(TlsBrokerOptions::default().tls12_only())
        .client(client);

    let outcome = run_scenario(&pki, scenario).await;
    outcome.assert_expected();
    assert!(matches!(
        outcome.handshake_failure(),
        Some(HandshakeFailure::ProtocolVersion(_))
    ));
}

// =============================================================================
// Channel behavior
// =============================================================================

/// Bytes the broker sends while the client-auth verdict is pending are not lost.
#[tokio::test]
async fn test_early_broker_bytes_are_replayed() {
    let pki = TestPki::generate();
    let broker = TlsTestBroker::start(
        &pki,
        TlsBrokerOptions::default().greeting(b"hello"),
        Arc::new(RecordingReporter::default()),
    )
    .await
    .unwrap();

    let connector = SecureConnector::with_transport(TrackingTransport::new())
        .with_client_auth_confirm_timeout(Duration::from_secs(2));
    let mut channel = connector
        .connect(&broker.localhost_address(), Some(&pki.client_config()))
        .await
        .unwrap();

    assert_eq!(channel.protocol_version(), Some(ProtocolVersion::TLSv1_3));
    assert_eq!(channel.server_name(), "localhost");

    let mut greeting = [0u8; 5];
    channel.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"hello");

    channel.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    channel.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");
}

/// A silent TLS 1.3 broker that accepts the certificate still costs the whole
/// verdict window. TLS 1.2 settles the verdict in the handshake and skips it.
#[tokio::test]
async fn test_verdict_window_only_charged_on_tls13() {
    let pki = TestPki::generate();
    let window = Duration::from_millis(400);

    let tls13 = TlsTestBroker::start(
        &pki,
        TlsBrokerOptions::default(),
        Arc::new(RecordingReporter::default()),
    )
    .await
    .unwrap();
    let tls12 = TlsTestBroker::start(
        &pki,
        TlsBrokerOptions::default().tls12_only(),
        Arc::new(RecordingReporter::default()),
    )
    .await
    .unwrap();

    let connector = SecureConnector::with_transport(TrackingTransport::new())
        .with_client_auth_confirm_timeout(window);

    let started = Instant::now();
    connector
        .connect(&tls13.localhost_address(), Some(&pki.client_config()))
        .await
        .unwrap();
    assert!(started.elapsed() >= window);

    let started = Instant::now();
    let channel = connector
        .connect(&tls12.localhost_address(), Some(&pki.client_config()))
        .await
        .unwrap();
    assert_eq!(channel.protocol_version(), Some(ProtocolVersion::TLSv1_2));
    assert!(started.elapsed() < window);
}

/// The broker sees the client certificate on a secured channel.
#[tokio::test]
async fn test_broker_sees_client_certificate() {
    let pki = TestPki::generate();
    let reporter = Arc::new(RecordingReporter::default());
    let broker = TlsTestBroker::start(&pki, TlsBrokerOptions::default(), reporter.clone())
        .await
        .unwrap();

    let connector = SecureConnector::with_transport(TrackingTransport::new());
    let mut channel = connector
        .connect(&broker.localhost_address(), Some(&pki.client_config()))
        .await
        .unwrap();
    assert!(channel.peer_certificates().is_some_and(|chain| !chain.is_empty()));

    channel.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    channel.read_exact(&mut reply).await.unwrap();

    let sessions = broker.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].client_certificates, 1);
    assert!(reporter.failures().is_empty());
}

/// Concurrent attempts through one connector are independent.
#[tokio::test]
async fn test_concurrent_connects() {
    let pki = TestPki::generate();
    let broker = TlsTestBroker::start(
        &pki,
        TlsBrokerOptions::default(),
        Arc::new(DiscardingReporter),
    )
    .await
    .unwrap();

    let transport = TrackingTransport::new();
    let connector = SecureConnector::with_transport(transport.clone());
    let address = broker.localhost_address();
    let good = pki.client_config();
    let bad = pki.client_config_without_identity();

    let attempts = (0..8).map(|i| {
        let config = if i % 2 == 0 { &good } else { &bad };
        connector.connect(&address, Some(config))
    });
    let results = futures::future::join_all(attempts).await;

    for (i, result) in results.iter().enumerate() {
        if i % 2 == 0 {
            assert!(result.is_ok(), "attempt {i} should succeed: {result:?}");
        } else {
            assert_eq!(
                result.as_ref().unwrap_err().handshake_failure(),
                Some(&HandshakeFailure::ClientAuthNotOffered)
            );
        }
    }

    assert_eq!(transport.dial_count(), 8);
    assert_eq!(transport.open_streams(), 4);
    drop(results);
    assert_eq!(transport.open_streams(), 0);
}

// =============================================================================
// Transport failures and cancellation
// =============================================================================

/// Nothing listening: a transport error, not a handshake error.
#[tokio::test]
async fn test_connection_refused() {
    let pki = TestPki::generate();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = TrackingTransport::new();
    let connector = SecureConnector::with_transport(transport.clone());
    let err = connector
        .connect(&format!("localhost:{port}"), Some(&pki.client_config()))
        .await
        .unwrap_err();

    assert!(err.is_transport());
    assert!(matches!(err, ConnectError::Transport { .. }));
    assert_eq!(transport.open_streams(), 0);
}

/// A peer that accepts TCP but never speaks TLS.
#[tokio::test]
async fn test_handshake_timeout_releases_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let held = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            streams.push(stream);
        }
    });

    let pki = TestPki::generate();
    let transport = TrackingTransport::new();
    let connector = SecureConnector::with_transport(transport.clone())
        .with_handshake_timeout(Duration::from_millis(200));

    let err = connector
        .connect(&address, Some(&pki.client_config()))
        .await
        .unwrap_err();
    assert_eq!(err.handshake_failure(), Some(&HandshakeFailure::Timeout));
    assert_eq!(transport.dial_count(), 1);
    assert_eq!(transport.open_streams(), 0);

    held.abort();
}

/// Dropping a pending attempt closes its stream.
#[tokio::test]
async fn test_cancelled_connect_releases_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let held = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            streams.push(stream);
        }
    });

    let pki = TestPki::generate();
    let transport = TrackingTransport::new();
    let connector = SecureConnector::with_transport(transport.clone());
    let config = pki.client_config();

    let result = tokio::time::timeout(
        Duration::from_millis(200),
        connector.connect(&address, Some(&config)),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(transport.dial_count(), 1);
    assert_eq!(transport.open_streams(), 0);

    held.abort();
}
