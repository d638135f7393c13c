//! agrd - AGR kernel daemon
//!
//! Hosts one kernel: creates the bootstrap groups, listens for peer kernels,
//! connects to the configured peers and runs until SIGINT or SIGTERM.

use std::net::SocketAddr;

use agr_kernel::{telemetry, Kernel, KernelConfig};
use anyhow::Context;
use clap::Parser;
use tracing::info;

/// AGR kernel daemon CLI
#[derive(Parser)]
#[command(name = "agrd")]
#[command(about = "AGR kernel daemon - distributed Community/Group/Role agent kernel", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGR_CONFIG")]
    config: Option<String>,

    /// Address accepting peer kernels (enables networking)
    #[arg(short, long, env = "AGR_LISTEN")]
    listen: Option<SocketAddr>,

    /// Peer kernel to connect to, repeatable (enables networking)
    #[arg(short, long = "peer")]
    peers: Vec<SocketAddr>,

    /// Log level
    #[arg(long, env = "AGR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "AGR_LOG_JSON")]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = KernelConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if let Some(listen) = cli.listen {
        config.network.listen_addr = Some(listen);
        config.network.enabled = true;
    }
    if !cli.peers.is_empty() {
        config.network.peers.extend(cli.peers);
        config.network.enabled = true;
    }

    telemetry::init_tracing(&config.logging);

    let kernel = Kernel::new(config).context("starting kernel")?;
    info!(
        kernel = %kernel.id(),
        version = env!("CARGO_PKG_VERSION"),
        listen = ?kernel.listen_addr(),
        peers = kernel.peers().len(),
        "agrd running"
    );

    // Kernel and agent threads are plain OS threads; the runtime only
    // waits for the termination signal.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime
        .block_on(shutdown_signal())
        .context("waiting for termination signal")?;

    kernel.shutdown();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
    Ok(())
}
