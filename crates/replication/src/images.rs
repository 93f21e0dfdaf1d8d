//! Persistent image replication
//!
//! Each image has one replication row per destination site:
//!
//! ```text
//! pending --send--> awaiting_confirmation --ack--> done
//!    ^                       |
//!    +---- timeout, +1 retry +
//! ```
//!
//! Rows that reach the retry limit are parked: never selected again, never
//! deleted, and made eligible again only by an operator resetting retries.
//! An acknowledgement marks a row done whatever its retry count.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use wxpush_protocol::Timestamp;
use wxpush_storage::{
    ImageRow, ReplicationState, ReplicationStatus, ReplicationSummary, StationStore, StorageError,
};

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationPolicy {
    /// Images selected per transmit wake-up
    pub batch_size: usize,

    /// Timeouts before a row is parked
    pub retry_limit: u32,

    /// How long a row may await confirmation
    pub awaiting_timeout: Duration,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            batch_size: 5,
            retry_limit: 5,
            awaiting_timeout: Duration::from_secs(600),
        }
    }
}

pub struct ImageReplicator {
    store: Arc<dyn StationStore>,
    site_id: i32,
    policy: ReplicationPolicy,
}

impl ImageReplicator {
    pub fn new(store: Arc<dyn StationStore>, site_id: i32, policy: ReplicationPolicy) -> Self {
        Self {
            store,
            site_id,
            policy,
        }
    }

    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    pub fn site_id(&self) -> i32 {
        self.site_id
    }

    /// Oldest pending rows still within the retry budget
    pub async fn select_batch(&self) -> Result<Vec<ReplicationStatus>, ReplicationError> {
        Ok(self
            .store
            .select_pending(self.site_id, self.policy.retry_limit, self.policy.batch_size)
            .await?)
    }

    pub async fn mark_awaiting(&self, image_id: i64, now: Timestamp) -> Result<(), ReplicationError> {
        self.store
            .set_status(
                self.site_id,
                image_id,
                ReplicationState::AwaitingConfirmation,
                now,
            )
            .await?;
        Ok(())
    }

    /// Select a batch, load the images and mark them awaiting confirmation
    pub async fn next_batch(&self, now: Timestamp) -> Result<Vec<ImageRow>, ReplicationError> {
        let rows = self.select_batch().await?;
        let mut images = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(image) = self.store.image(row.image_id).await? else {
                warn!(
                    image_id = row.image_id,
                    site = self.site_id,
                    "Replication row has no image, skipping"
                );
                continue;
            };
            self.mark_awaiting(row.image_id, now).await?;
            images.push(image);
        }
        if !images.is_empty() {
            debug!(count = images.len(), site = self.site_id, "Selected images to send");
        }
        Ok(images)
    }

    pub async fn acknowledge(&self, image_id: i64, now: Timestamp) -> Result<(), ReplicationError> {
        self.store
            .set_status(self.site_id, image_id, ReplicationState::Done, now)
            .await?;
        Ok(())
    }

    /// Return rows stuck awaiting confirmation to pending, one retry used
    pub async fn sweep_expired(&self, now: Timestamp) -> Result<u64, ReplicationError> {
        let timeout = self.policy.awaiting_timeout.as_secs().min(u32::MAX as u64) as u32;
        let cutoff = Timestamp::from_unix(now.as_unix().saturating_sub(timeout));
        let moved = self.store.expire_awaiting(self.site_id, cutoff, now).await?;
        if moved > 0 {
            warn!(
                "{} images unconfirmed after {:?}, returned to pending",
                moved, self.policy.awaiting_timeout
            );
        }
        Ok(moved)
    }

    /// Make parked rows eligible again
    pub async fn reset_retries(&self, image_id: Option<i64>) -> Result<u64, ReplicationError> {
        let reset = self.store.reset_retries(self.site_id, image_id).await?;
        info!(site = self.site_id, reset, "Reset image retry counters");
        Ok(reset)
    }

    pub async fn parked(&self) -> Result<Vec<ReplicationStatus>, ReplicationError> {
        Ok(self
            .store
            .parked(self.site_id, self.policy.retry_limit)
            .await?)
    }

    pub async fn summary(&self) -> Result<ReplicationSummary, ReplicationError> {
        Ok(self
            .store
            .summary(self.site_id, self.policy.retry_limit)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wxpush_protocol::Code;
    use wxpush_storage::MemoryStore;

    fn image(ts: u32) -> ImageRow {
        ImageRow {
            id: 0,
            source_code: Code::new("cam1").unwrap(),
            type_code: Code::new("CAM").unwrap(),
            timestamp: Timestamp::from_unix(ts),
            title: String::new(),
            description: String::new(),
            mime_type: "image/png".into(),
            metadata: String::new(),
            data: Bytes::from_static(b"png"),
        }
    }

    fn at(secs: u32) -> Timestamp {
        Timestamp::from_unix(secs)
    }

    async fn setup(images: u32) -> (Arc<MemoryStore>, ImageReplicator, Vec<i64>) {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..images {
            ids.push(store.insert_image(&image(i), &[1]).await.unwrap());
        }
        let replicator = ImageReplicator::new(store.clone(), 1, ReplicationPolicy::default());
        (store, replicator, ids)
    }

    #[tokio::test]
    async fn test_batch_limited_and_marked() {
        let (store, replicator, ids) = setup(7).await;

        let batch = replicator.next_batch(at(1000)).await.unwrap();
        assert_eq!(batch.len(), 5);
        let status = store.replication_status(1, batch[0].id).unwrap();
        assert_eq!(status.status, ReplicationState::AwaitingConfirmation);
        assert_eq!(status.retries, 0);

        let rest = replicator.next_batch(at(1001)).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(ids.len(), 7);
    }

    #[tokio::test]
    async fn test_missing_image_skipped() {
        let (store, replicator, ids) = setup(3).await;
        store.remove_image(ids[1]);

        let batch = replicator.next_batch(at(1000)).await.unwrap();
        let sent: Vec<i64> = batch.iter().map(|image| image.id).collect();
        assert_eq!(sent, vec![ids[0], ids[2]]);
        assert_eq!(
            store.replication_status(1, ids[1]).unwrap().status,
            ReplicationState::Pending
        );
    }

    #[tokio::test]
    async fn test_timeout_increments_exactly_once() {
        let (store, replicator, ids) = setup(1).await;
        replicator.next_batch(at(1000)).await.unwrap();

        // Not yet 10 minutes
        assert_eq!(replicator.sweep_expired(at(1500)).await.unwrap(), 0);
        assert_eq!(replicator.sweep_expired(at(1601)).await.unwrap(), 1);
        let status = store.replication_status(1, ids[0]).unwrap();
        assert_eq!((status.status, status.retries), (ReplicationState::Pending, 1));

        // Back in the pending set
        assert_eq!(replicator.select_batch().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parked_after_retry_limit() {
        let (store, replicator, ids) = setup(1).await;
        let mut now = 1000;
        for _ in 0..5 {
            assert_eq!(replicator.next_batch(at(now)).await.unwrap().len(), 1);
            now += 601;
            replicator.sweep_expired(at(now)).await.unwrap();
        }

        assert!(replicator.select_batch().await.unwrap().is_empty());
        let parked = replicator.parked().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retries, 5);

        // Operator reset makes it selectable again
        assert_eq!(replicator.reset_retries(Some(ids[0])).await.unwrap(), 1);
        assert_eq!(replicator.select_batch().await.unwrap().len(), 1);
        assert!(replicator.parked().await.unwrap().is_empty());
        assert_eq!(store.replication_status(1, ids[0]).unwrap().retries, 0);
    }

    #[tokio::test]
    async fn test_ack_done_regardless_of_retries() {
        let (store, replicator, ids) = setup(1).await;
        let mut now = 1000;
        for _ in 0..5 {
            replicator.next_batch(at(now)).await.unwrap();
            now += 601;
            replicator.sweep_expired(at(now)).await.unwrap();
        }

        // A very late acknowledgement still lands
        replicator.acknowledge(ids[0], at(now)).await.unwrap();
        let status = store.replication_status(1, ids[0]).unwrap();
        assert_eq!(status.status, ReplicationState::Done);
        assert!(replicator.parked().await.unwrap().is_empty());
    }
}
