//! Background timeout sweep for images awaiting confirmation

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use wxpush_protocol::Timestamp;
use wxpush_replication::ImageReplicator;

/// Return timed-out images to pending every `interval` until shutdown
pub fn start_sweeper(
    images: Arc<ImageReplicator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Image sweeper started, checking every {}s",
            interval.as_secs()
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match images.sweep_expired(Timestamp::now()).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "Unconfirmed images returned to pending"),
                        Err(e) => error!("Image sweep failed: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wxpush_protocol::Code;
    use wxpush_replication::ReplicationPolicy;
    use wxpush_storage::{ImageRow, MemoryStore, ReplicationState, StationStore};

    #[tokio::test]
    async fn test_sweeper_requeues_expired_and_stops() {
        let store = MemoryStore::new();
        let image_id = store
            .insert_image(
                &ImageRow {
                    id: 0,
                    source_code: Code::new("cam1").unwrap(),
                    type_code: Code::new("CAM").unwrap(),
                    timestamp: Timestamp::from_unix(10),
                    title: String::new(),
                    description: String::new(),
                    mime_type: "image/jpeg".into(),
                    metadata: String::new(),
                    data: Bytes::from_static(b"jpg"),
                },
                &[1],
            )
            .await
            .unwrap();

        let policy = ReplicationPolicy {
            awaiting_timeout: Duration::ZERO,
            ..ReplicationPolicy::default()
        };
        let images = Arc::new(ImageReplicator::new(store.clone(), 1, policy));
        // Sent long ago and never confirmed
        images.mark_awaiting(image_id, Timestamp::from_unix(1)).await.unwrap();

        let (shutdown_tx, shutdown) = watch::channel(false);
        let handle = start_sweeper(images, Duration::from_millis(10), shutdown);
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(
            store.replication_status(1, image_id).unwrap().status,
            ReplicationState::Pending
        );
    }
}
