use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow::{ClientConfig, TunnelOrchestrator};

/// Burrow - expose private services through a public broker
#[derive(Parser, Debug)]
#[command(name = "burrow", version)]
#[command(about = "Expose local services on a public broker over a reverse tunnel")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow=info".parse()?)
                .add_directive("burrow_common=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting burrow {}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::load_and_resolve(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    for tunnel in &config.tunnels {
        tracing::info!(
            "Tunnel '{}': {} -> remote port {}",
            tunnel.name,
            tunnel.local_target(),
            tunnel.remote_port
        );
    }

    let orchestrator =
        TunnelOrchestrator::new(config).context("Failed to set up the tunnel client")?;
    orchestrator.run_until(shutdown_signal()).await;

    tracing::info!("Client shutdown complete");
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
