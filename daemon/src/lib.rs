//! wxpush archive server
//!
//! Accepts weather data and images from station uploaders over TCP (directly
//! or through an SSH tunnel) and UDP, archives them and acknowledges receipt.

pub mod config;
pub mod decoder;
pub mod metrics;
pub mod peer_registry;
pub mod session;
pub mod tcp_server;
pub mod udp_server;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use wxpush_storage::{ArchiveStore, MemoryStore, PgStore, RegistryStore};

use config::{DaemonConfig, DatabaseBackend};
use metrics::Metrics;
use peer_registry::PeerRegistry;
use session::ServerContext;
use tcp_server::TcpServer;
use udp_server::UdpServer;

/// The configured store, seen through both of its roles
pub struct Stores {
    pub archive: Arc<dyn ArchiveStore>,
    pub registry: Arc<dyn RegistryStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            archive: store.clone(),
            registry: store,
        }
    }

    /// Open the configured backend and register the configured sites
    pub async fn open(config: &DaemonConfig) -> Result<Self> {
        let stores = match config.database.backend {
            DatabaseBackend::Memory => Self::memory(),
            DatabaseBackend::Postgres => {
                let store = PgStore::connect(&config.database.url).await?;
                store.migrate().await?;
                let store = Arc::new(store);
                Self {
                    archive: store.clone(),
                    registry: store,
                }
            }
        };

        for site in &config.sites {
            site.register(stores.registry.as_ref()).await?;
        }
        Ok(stores)
    }
}

/// Bound listeners, ready to run
pub struct Daemon {
    ctx: Arc<ServerContext>,
    tcp: Option<TcpServer>,
    udp: Option<UdpServer>,
}

impl Daemon {
    pub async fn bind(
        config: &DaemonConfig,
        store: Arc<dyn ArchiveStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let ctx = ServerContext::new(store, metrics);

        let tcp = match config.server.tcp_bind {
            Some(addr) => Some(
                TcpServer::new(
                    TcpListener::bind(addr).await?,
                    ctx.clone(),
                    config.server.max_frame_size,
                )
                .with_shutdown_timeout(config.server.shutdown_timeout()),
            ),
            None => None,
        };
        let udp = match config.server.udp_bind {
            Some(addr) => Some(UdpServer::new(
                UdpSocket::bind(addr).await?,
                ctx.clone(),
                PeerRegistry::new(config.server.udp_peer_expiry(), config.server.udp_mtu),
            )),
            None => None,
        };

        Ok(Self { ctx, tcp, udp })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Serve until `shutdown` turns true or a listener fails. Returns once
    /// every listener has stopped and open connections have drained.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = JoinSet::new();
        if let Some(tcp) = self.tcp {
            tasks.spawn(tcp.run(shutdown.clone()));
        }
        if let Some(udp) = self.udp {
            tasks.spawn(udp.run(shutdown));
        }

        while let Some(result) = tasks.join_next().await {
            result??;
        }
        info!("All listeners stopped");
        Ok(())
    }
}
