//! Database change notifications as uploader hints
//!
//! The station database raises `LISTEN`/`NOTIFY` events when the data logger
//! writes a sample, a live reading or an image. Samples and images become
//! plain wake-up hints. A live notification is turned into the reading itself
//! so it can be forwarded right away.

use crate::notify::{LiveReading, Notification, Notifier};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wxpush_protocol::Code;
use wxpush_storage::{IMAGE_CHANNEL, LIVE_CHANNEL, PgStore, SAMPLE_CHANNEL, StationStore};

/// Wait before listening again after the connection drops
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Hint for one notification. The payload of live and sample notifications
/// is the station code.
pub async fn hint_for(
    store: &dyn StationStore,
    channel: &str,
    payload: &str,
) -> Result<Option<Notification>> {
    if channel == IMAGE_CHANNEL {
        return Ok(Some(Notification::Image));
    }
    if channel != LIVE_CHANNEL && channel != SAMPLE_CHANNEL {
        debug!(channel, "Ignoring notification");
        return Ok(None);
    }

    let station = match Code::new(payload.trim()) {
        Ok(station) => station,
        Err(e) => {
            warn!(channel, payload, "Bad station code in notification: {}", e);
            return Ok(None);
        }
    };
    if channel == SAMPLE_CHANNEL {
        return Ok(Some(Notification::Sample(station)));
    }

    Ok(store.latest_live(&station).await?.map(|live| {
        Notification::Live(LiveReading {
            station: live.station_code,
            field_list: live.field_list,
            field_data: live.field_data,
        })
    }))
}

/// Forward notifications from `database` until shutdown, listening again
/// whenever the connection is lost
pub fn start_watcher(
    database: PgStore,
    store: Arc<dyn StationStore>,
    notifier: Notifier,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match watch_changes(&database, store.as_ref(), &notifier, &mut shutdown).await {
                Ok(()) => return,
                Err(e) => warn!("Database listener failed: {:#}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    })
}

async fn watch_changes(
    database: &PgStore,
    store: &dyn StationStore,
    notifier: &Notifier,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut listener = database.listen().await?;
    info!("Listening for database changes");

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let notification = tokio::select! {
            notification = listener.recv() => notification?,
            _ = shutdown.changed() => return Ok(()),
        };

        let Some(hint) = hint_for(store, notification.channel(), notification.payload()).await?
        else {
            continue;
        };
        if !notifier.try_notify(hint) {
            debug!(channel = notification.channel(), "Uploader busy, hint dropped");
        }
    }
}
