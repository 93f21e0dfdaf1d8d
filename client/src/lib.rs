//! wxpush Client Library
//!
//! Replicates a station's samples, live readings and images to an archive
//! server over UDP, TCP or an SSH tunnel.

pub mod config;
pub mod notify;
pub mod state;
pub mod sweeper;
pub mod tcp_session;
pub mod udp_session;
pub mod uploader;
pub mod watcher;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use wxpush_storage::{MemoryStore, PgStore, StationStore};

use config::{DatabaseBackend, DatabaseConfig};

/// An opened station database
pub struct LocalDatabase {
    pub store: Arc<dyn StationStore>,

    /// Set when the database can push change notifications
    pub postgres: Option<PgStore>,
}

/// Open the local station database
pub async fn open_store(config: &DatabaseConfig) -> Result<LocalDatabase> {
    match config.backend {
        DatabaseBackend::Memory => {
            info!("Using in-memory station store");
            Ok(LocalDatabase {
                store: MemoryStore::new(),
                postgres: None,
            })
        }
        DatabaseBackend::Postgres => {
            let store = PgStore::connect(&config.url).await?;
            store.migrate().await?;
            info!("Connected to station database");
            Ok(LocalDatabase {
                store: Arc::new(store.clone()),
                postgres: Some(store),
            })
        }
    }
}
