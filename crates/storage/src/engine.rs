//! Store contracts for the archive server and the station uploader

use async_trait::async_trait;
use thiserror::Error;
use wxpush_protocol::{Code, Timestamp};

use crate::{
    ImageRow, ImageSourceRecord, LiveRow, ReplicationState, ReplicationStatus,
    ReplicationSummary, SampleRow, StationRecord,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Registration of stations, image types and image sources. Re-registering
/// an existing entry is not an error.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn register_station(&self, station: &StationRecord) -> Result<(), StorageError>;

    /// Allow `auth_code` to upload for an already registered station
    async fn grant_access(&self, auth_code: u64, station: &Code) -> Result<(), StorageError>;

    async fn register_image_type(&self, code: &Code) -> Result<(), StorageError>;

    async fn register_image_source(&self, source: &ImageSourceRecord)
    -> Result<(), StorageError>;
}

/// Archive side: what an authorisation code may see, and where received data
/// goes. Inserts are idempotent so resent samples and images are harmless.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Whether any station is registered for `auth_code`
    async fn authorise(&self, auth_code: u64) -> Result<bool, StorageError>;

    /// Stations visible to `auth_code`, ordered by code
    async fn stations_for(&self, auth_code: u64) -> Result<Vec<StationRecord>, StorageError>;

    /// Every registered image type, ordered by code
    async fn image_types(&self) -> Result<Vec<Code>, StorageError>;

    /// Image sources owned by stations visible to `auth_code`
    async fn image_sources_for(
        &self,
        auth_code: u64,
    ) -> Result<Vec<ImageSourceRecord>, StorageError>;

    /// Stored sample for `station` at exactly `timestamp`
    async fn sample(
        &self,
        station: &Code,
        timestamp: Timestamp,
    ) -> Result<Option<SampleRow>, StorageError>;

    /// Returns how many samples were new
    async fn store_samples(&self, samples: &[SampleRow]) -> Result<u64, StorageError>;

    async fn store_live(&self, live: &LiveRow) -> Result<(), StorageError>;

    /// Returns false if the image was already stored
    async fn store_image(&self, image: &ImageRow) -> Result<bool, StorageError>;
}

/// Station side: local data awaiting upload and its replication state
#[async_trait]
pub trait StationStore: Send + Sync {
    async fn local_stations(&self) -> Result<Vec<StationRecord>, StorageError>;

    /// Samples for `station` strictly newer than `after`, oldest first
    async fn samples_after(
        &self,
        station: &Code,
        after: Timestamp,
        limit: usize,
    ) -> Result<Vec<SampleRow>, StorageError>;

    /// Current live reading for `station`, if the logger has written one
    async fn latest_live(&self, station: &Code) -> Result<Option<LiveRow>, StorageError>;

    async fn load_watermark(
        &self,
        site_id: i32,
        station: &Code,
    ) -> Result<Option<Timestamp>, StorageError>;

    async fn save_watermark(
        &self,
        site_id: i32,
        station: &Code,
        timestamp: Timestamp,
    ) -> Result<(), StorageError>;

    /// Insert an image and create a pending replication row per site
    async fn insert_image(&self, image: &ImageRow, sites: &[i32]) -> Result<i64, StorageError>;

    async fn image(&self, image_id: i64) -> Result<Option<ImageRow>, StorageError>;

    /// Resolve an acknowledgement back to a stored image
    async fn find_image(
        &self,
        source: &Code,
        image_type: &Code,
        timestamp: Timestamp,
    ) -> Result<Option<i64>, StorageError>;

    /// Pending rows with `retries < retry_limit`, oldest transition first
    async fn select_pending(
        &self,
        site_id: i32,
        retry_limit: u32,
        limit: usize,
    ) -> Result<Vec<ReplicationStatus>, StorageError>;

    async fn set_status(
        &self,
        site_id: i32,
        image_id: i64,
        status: ReplicationState,
        now: Timestamp,
    ) -> Result<(), StorageError>;

    /// Move rows awaiting confirmation since before `cutoff` back to pending,
    /// incrementing their retry counter. Returns the number moved.
    async fn expire_awaiting(
        &self,
        site_id: i32,
        cutoff: Timestamp,
        now: Timestamp,
    ) -> Result<u64, StorageError>;

    /// Zero the retry counter of one image, or of every row for the site
    async fn reset_retries(&self, site_id: i32, image_id: Option<i64>)
    -> Result<u64, StorageError>;

    /// Rows not done with `retries >= retry_limit`
    async fn parked(
        &self,
        site_id: i32,
        retry_limit: u32,
    ) -> Result<Vec<ReplicationStatus>, StorageError>;

    async fn summary(
        &self,
        site_id: i32,
        retry_limit: u32,
    ) -> Result<ReplicationSummary, StorageError>;
}
