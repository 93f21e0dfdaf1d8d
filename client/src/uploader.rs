//! Connect, run a session, wait, repeat

use crate::config::{ClientConfig, Transport};
use crate::notify::Notification;
use crate::state::UploadState;
use crate::sweeper::start_sweeper;
use crate::tcp_session::{SessionEnd, SessionSettings, TcpSession};
use crate::udp_session::UdpSession;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use wxpush_replication::ImageReplicator;
use wxpush_storage::StationStore;

/// Upload until shutdown is signalled or a fatal transport error occurs
pub async fn run(
    config: &ClientConfig,
    store: Arc<dyn StationStore>,
    mut notifications: mpsc::Receiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let images = Arc::new(ImageReplicator::new(
        store.clone(),
        config.replication.site_id,
        config.replication.policy(),
    ));
    let sweeper = start_sweeper(
        images.clone(),
        config.replication.sweep_interval(),
        shutdown.clone(),
    );

    // Datagrams may arrive out of order, so UDP samples never diff against
    // each other
    let chain_samples = config.connection.transport != Transport::Udp;
    let mut state = UploadState::new(
        store,
        images,
        config.replication.sample_batch_size,
        config.replication.sample_resend(),
    )
    .await?
    .with_delta_encoding(config.replication.compress, chain_samples);

    let settings = SessionSettings {
        auth_code: config.connection.auth_code,
        auth_timeout: config.connection.auth_timeout(),
        transmit_interval: config.replication.transmit_interval(),
    };

    let result = match config.connection.transport {
        Transport::Udp => run_udp(config, &mut state, settings, &mut notifications, &mut shutdown).await,
        Transport::Tcp | Transport::Ssh => {
            run_stream(config, &mut state, settings, &mut notifications, &mut shutdown).await
        }
    };

    sweeper.abort();
    result
}

async fn run_stream(
    config: &ClientConfig,
    state: &mut UploadState,
    settings: SessionSettings,
    notifications: &mut mpsc::Receiver<Notification>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let connector = config.connector()?;
    let policy = config.connection.reconnect_policy();

    loop {
        info!("Connecting to {}", connector.describe());
        let delay = match connector.connect().await {
            Ok(stream) => {
                info!("Connected to {}", connector.describe());
                match TcpSession::new(stream, state, settings)
                    .run(notifications, shutdown)
                    .await
                {
                    Ok(SessionEnd::Shutdown) => return Ok(()),
                    Ok(SessionEnd::Disconnected) => warn!("Server closed the connection"),
                    Err(e) => warn!("Session ended: {:#}", e),
                }
                policy.backoff
            }
            Err(e) => match policy.next_delay(&e) {
                Some(delay) => {
                    warn!("Connection to {} failed: {}", connector.describe(), e);
                    delay
                }
                None => {
                    error!("Giving up on {}: {}", connector.describe(), e);
                    return Err(e.into());
                }
            },
        };

        if wait_or_shutdown(delay, shutdown).await {
            return Ok(());
        }
    }
}

async fn run_udp(
    config: &ClientConfig,
    state: &mut UploadState,
    settings: SessionSettings,
    notifications: &mut mpsc::Receiver<Notification>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let target = format!("{}:{}", config.connection.host, config.connection.port);
    let backoff = config.connection.reconnect_policy().backoff;

    loop {
        match connect_udp(&target).await {
            Ok(socket) => {
                info!("Sending datagrams to {}", target);
                match UdpSession::new(socket, config.connection.udp_mtu, state, settings)
                    .run(notifications, shutdown)
                    .await
                {
                    Ok(_) => return Ok(()),
                    Err(e) => warn!("UDP session failed: {:#}", e),
                }
            }
            Err(e) => warn!("Cannot reach {}: {:#}", target, e),
        }

        if wait_or_shutdown(backoff, shutdown).await {
            return Ok(());
        }
    }
}

async fn connect_udp(target: &str) -> Result<UdpSocket> {
    let addr = tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve", target))?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Sleep for `delay`. Returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
