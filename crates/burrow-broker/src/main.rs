use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow_broker::{Broker, BrokerConfig, BrokerOverrides, PortAllocator};
use burrow_common::transport::AccessPolicy;
use burrow_common::BrokerIdentity;

/// Reverse tunnel broker - exposes client services on public ports
#[derive(Parser, Debug)]
#[command(name = "burrow-broker", version)]
#[command(about = "Public broker for burrow reverse tunnels")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "broker.toml")]
    config: String,

    /// Control port clients connect to
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared token clients must present
    #[arg(short, long)]
    token: Option<String>,

    /// Address the control port binds
    #[arg(long)]
    listen: Option<String>,

    /// Address forwarded public ports bind
    #[arg(long)]
    public_addr: Option<String>,

    /// Accept clients without a token
    #[arg(long)]
    allow_anonymous: bool,

    /// Broker certificate (path, file://, env://, base64:// or PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Broker private key (path, file://, env://, base64:// or PEM)
    #[arg(long)]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow_broker=info".parse()?)
                .add_directive("burrow_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!(
        "Starting burrow-broker {} with config: {}",
        env!("CARGO_PKG_VERSION"),
        args.config
    );

    let overrides = BrokerOverrides {
        port: args.port,
        listen_addr: args.listen,
        public_addr: args.public_addr,
        token: args.token,
        allow_anonymous: args.allow_anonymous,
        cert: args.cert,
        key: args.key,
    };
    let config = BrokerConfig::load_and_resolve(&args.config, &overrides)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    if matches!(config.access, AccessPolicy::Open) {
        tracing::warn!("Anonymous access enabled: any client may forward ports");
    }

    let (cert_pem, key_pem) = match config.identity {
        Some(identity) => identity,
        None => {
            tracing::info!("No certificate configured, generating an ephemeral identity");
            let identity = BrokerIdentity::generate(&["localhost".to_string()])
                .context("Failed to generate broker identity")?;
            (identity.cert_pem, identity.key_pem)
        }
    };

    let tls_config = burrow_common::load_server_config(&cert_pem, &key_pem)
        .context("Failed to load TLS configuration")?;

    let broker = Broker::new(
        Arc::new(tls_config),
        Arc::new(config.access),
        PortAllocator::new(config.public_ip),
        config.handshake_timeout,
    );

    tokio::select! {
        result = broker.run(config.listen_addr) => {
            result.with_context(|| format!("Broker on {} stopped", config.listen_addr))?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, closing sessions...");
        }
    }

    tracing::info!("Broker shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
