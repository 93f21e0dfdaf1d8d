//! wxpush Client
//!
//! Uploads weather data and images from the local station database.

use anyhow::Result;
use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wxpush_client::config::ClientConfig;
use wxpush_client::{notify, open_store, uploader, watcher};

/// wxpush Client - weather station uploader
#[derive(Parser, Debug)]
#[command(name = "wxpush")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wxpush.toml")]
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

    info!("wxpush Client v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ClientConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    let database = open_store(&config.database).await?;

    let (notifier, notifications) = notify::channel(notify::DEFAULT_CAPACITY);
    let (shutdown_tx, shutdown) = tokio::sync::watch::channel(false);

    // Without a change feed the transmit timer picks up new data
    let watcher = database.postgres.clone().map(|postgres| {
        watcher::start_watcher(postgres, database.store.clone(), notifier, shutdown.clone())
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = uploader::run(&config, database.store, notifications, shutdown).await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    result
}
