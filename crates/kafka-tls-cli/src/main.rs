//! Kafka TLS check CLI
//!
//! Dials every configured broker, performs the mutually authenticated TLS
//! handshake and reports which brokers accepted the connection.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use futures::future::join_all;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_tls_core::config::{BrokerTlsConfig, ConnectionConfig, LoggingConfig, TlsVersion};
use kafka_tls_core::tls::TlsIdentityConfig;
use kafka_tls_core::SecureConnector;

/// Check Kafka brokers over mutually authenticated TLS.
#[derive(Parser)]
#[command(name = "kafka-tls-probe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker to check (host:port). Replaces the configured bootstrap servers.
    #[arg(short, long = "broker")]
    brokers: Vec<String>,

    /// Verify broker certificates against this name instead of the dialed host.
    #[arg(long)]
    server_name: Option<String>,

    /// CA certificate (PEM) to trust instead of the bundled roots.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate (PEM).
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key (PEM).
    #[arg(long)]
    key: Option<PathBuf>,

    /// Minimum TLS version (TLSv1.2 or TLSv1.3).
    #[arg(long)]
    min_tls: Option<TlsVersion>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn has_tls_overrides(&self) -> bool {
        self.server_name.is_some()
            || self.ca_cert.is_some()
            || self.cert.is_some()
            || self.key.is_some()
            || self.min_tls.is_some()
    }

    /// Load the config file (if any) and apply command-line overrides.
    fn into_config(self) -> anyhow::Result<ConnectionConfig> {
        let mut config = match &self.config {
            Some(path) => ConnectionConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ConnectionConfig::default(),
        };

        if !self.brokers.is_empty() {
            config.bootstrap_servers = self.brokers.clone();
        }

        if self.has_tls_overrides() {
            let tls = config.tls.get_or_insert_with(BrokerTlsConfig::default);
            if let Some(server_name) = self.server_name {
                tls.server_name = Some(server_name);
            }
            if let Some(ca_cert) = self.ca_cert {
                tls.ca_cert_path = Some(ca_cert);
            }
            if let Some(cert) = self.cert {
                tls.cert_path = Some(cert);
            }
            if let Some(key) = self.key {
                tls.key_path = Some(key);
            }
            if let Some(min_tls) = self.min_tls {
                tls.min_version = min_tls;
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let verbose = args.verbose;

    let config = args.into_config()?;

    // Override log level from verbosity flag
    let log_config = match verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        brokers = config.bootstrap_servers.len(),
        "starting kafka tls check"
    );

    let identity = config
        .tls_identity()
        .context("failed to load TLS material")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { check_brokers(&config, &identity).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn check_brokers(config: &ConnectionConfig, identity: &TlsIdentityConfig) -> anyhow::Result<()> {
    let connector = SecureConnector::from_config(config);

    let attempts = config.bootstrap_servers.iter().map(|broker| {
        let connector = &connector;
        async move { (broker, connector.connect(broker, Some(identity)).await) }
    });

    let mut failed = 0usize;
    for (broker, result) in join_all(attempts).await {
        match result {
            Ok(mut channel) => {
                info!(
                    broker = %broker,
                    server_name = channel.server_name(),
                    protocol = ?channel.protocol_version(),
                    "broker accepted mutual TLS"
                );
                close_quietly(broker, &mut channel).await;
            }
            Err(e) => {
                failed += 1;
                error!(broker = %broker, error = %e, "broker check failed");
            }
        }
    }

    if failed > 0 {
        bail!(
            "{failed} of {} broker check(s) failed",
            config.bootstrap_servers.len()
        );
    }

    info!("all brokers accepted mutual TLS");
    Ok(())
}

/// Close a secured channel; a failed close does not fail the run.
async fn close_quietly<S: AsyncWrite + Unpin>(broker: &str, channel: &mut S) {
    if let Err(e) = channel.shutdown().await {
        debug!(broker = %broker, error = %e, "failed to close broker connection");
    }
}
