//! wxpush Daemon
//!
//! The archive server that receives weather data and images from stations.

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wxpush_daemon::config::DaemonConfig;
use wxpush_daemon::metrics::{self, Metrics};
use wxpush_daemon::{Daemon, Stores};

/// wxpush Daemon - weather archive server
#[derive(Parser, Debug)]
#[command(name = "wxpushd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wxpushd.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("wxpush Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = DaemonConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    let stores = Stores::open(&config).await?;
    let metrics = Metrics::new()?;
    let metrics_handle = metrics::start_server(&config.monitoring, metrics.clone());

    let daemon = Daemon::bind(&config, stores.archive, metrics).await?;

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for interrupt: {}", e);
            return;
        }
        warn!("Interrupted, shutting down");
        let _ = shutdown_tx.send(true);
    });
    daemon.run(shutdown).await?;

    // Cleanup
    metrics_handle.abort();

    Ok(())
}
