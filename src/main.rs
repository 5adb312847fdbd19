use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::Governor;

/// Telemetry governance sidecar.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML); `TOLLGATE__*` environment variables override it
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollgate telemetry governor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(
        monitor_ms = config.optimizer.monitor_interval_ms,
        optimization_ms = config.optimizer.optimization_interval_ms,
        "Configuration loaded"
    );

    let governor = Governor::new(config)?;
    governor.start()?;
    info!(governor_id = %governor.id(), "Governor running");

    shutdown_signal().await;

    governor.shutdown().await;
    info!(
        stats = %serde_json::to_string(&governor.stats())?,
        "Final governance statistics"
    );

    info!("Tollgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
