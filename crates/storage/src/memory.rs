//! In-process store
//!
//! Backs tests and single-process deployments. Implements both store
//! contracts over one set of tables behind a `parking_lot` lock.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use wxpush_protocol::{Code, Timestamp};

use crate::{
    ArchiveStore, ImageRow, ImageSourceRecord, LiveRow, RegistryStore, ReplicationState,
    ReplicationStatus, ReplicationSummary, SampleRow, StationRecord, StationStore, StorageError,
};

#[derive(Default)]
struct Tables {
    stations: BTreeMap<Code, StationRecord>,
    access: HashMap<u64, HashSet<Code>>,
    image_types: BTreeSet<Code>,
    image_sources: BTreeMap<Code, ImageSourceRecord>,

    samples: BTreeMap<(Code, Timestamp), SampleRow>,
    live: HashMap<Code, LiveRow>,

    images: BTreeMap<i64, ImageRow>,
    next_image_id: i64,
    replication: BTreeMap<(i32, i64), ReplicationStatus>,
    watermarks: HashMap<(i32, Code), Timestamp>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a sample to the local archive as a data logger would
    pub fn add_sample(&self, sample: SampleRow) {
        self.tables
            .write()
            .samples
            .insert((sample.station_code.clone(), sample.timestamp), sample);
    }

    /// Overwrite the current live reading as a data logger would
    pub fn add_live(&self, live: LiveRow) {
        self.tables
            .write()
            .live
            .insert(live.station_code.clone(), live);
    }

    /// Delete an image, leaving its replication rows behind
    pub fn remove_image(&self, image_id: i64) {
        self.tables.write().images.remove(&image_id);
    }

    pub fn samples(&self, station: &Code) -> Vec<SampleRow> {
        self.tables
            .read()
            .samples
            .range((station.clone(), Timestamp::from_unix(0))..)
            .take_while(|((code, _), _)| code == station)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn live(&self, station: &Code) -> Option<LiveRow> {
        self.tables.read().live.get(station).cloned()
    }

    pub fn images(&self) -> Vec<ImageRow> {
        self.tables.read().images.values().cloned().collect()
    }

    pub fn replication_status(&self, site_id: i32, image_id: i64) -> Option<ReplicationStatus> {
        self.tables
            .read()
            .replication
            .get(&(site_id, image_id))
            .cloned()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn register_station(&self, station: &StationRecord) -> Result<(), StorageError> {
        self.tables
            .write()
            .stations
            .insert(station.code.clone(), station.clone());
        Ok(())
    }

    async fn grant_access(&self, auth_code: u64, station: &Code) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        if !tables.stations.contains_key(station) {
            return Err(StorageError::NotFound(format!("station {station}")));
        }
        tables
            .access
            .entry(auth_code)
            .or_default()
            .insert(station.clone());
        Ok(())
    }

    async fn register_image_type(&self, code: &Code) -> Result<(), StorageError> {
        self.tables.write().image_types.insert(code.clone());
        Ok(())
    }

    async fn register_image_source(
        &self,
        source: &ImageSourceRecord,
    ) -> Result<(), StorageError> {
        self.tables
            .write()
            .image_sources
            .insert(source.code.clone(), source.clone());
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn authorise(&self, auth_code: u64) -> Result<bool, StorageError> {
        Ok(self
            .tables
            .read()
            .access
            .get(&auth_code)
            .is_some_and(|s| !s.is_empty()))
    }

    async fn stations_for(&self, auth_code: u64) -> Result<Vec<StationRecord>, StorageError> {
        let tables = self.tables.read();
        let Some(allowed) = tables.access.get(&auth_code) else {
            return Ok(Vec::new());
        };
        Ok(tables
            .stations
            .values()
            .filter(|s| allowed.contains(&s.code))
            .cloned()
            .collect())
    }

    async fn image_types(&self) -> Result<Vec<Code>, StorageError> {
        Ok(self.tables.read().image_types.iter().cloned().collect())
    }

    async fn image_sources_for(
        &self,
        auth_code: u64,
    ) -> Result<Vec<ImageSourceRecord>, StorageError> {
        let tables = self.tables.read();
        let Some(allowed) = tables.access.get(&auth_code) else {
            return Ok(Vec::new());
        };
        Ok(tables
            .image_sources
            .values()
            .filter(|s| allowed.contains(&s.station_code))
            .cloned()
            .collect())
    }

    async fn sample(
        &self,
        station: &Code,
        timestamp: Timestamp,
    ) -> Result<Option<SampleRow>, StorageError> {
        Ok(self
            .tables
            .read()
            .samples
            .get(&(station.clone(), timestamp))
            .cloned())
    }

    async fn store_samples(&self, samples: &[SampleRow]) -> Result<u64, StorageError> {
        let mut tables = self.tables.write();
        let mut added = 0;
        for sample in samples {
            let key = (sample.station_code.clone(), sample.timestamp);
            if !tables.samples.contains_key(&key) {
                tables.samples.insert(key, sample.clone());
                added += 1;
            }
        }
        debug!(added, received = samples.len(), "Stored samples");
        Ok(added)
    }

    async fn store_live(&self, live: &LiveRow) -> Result<(), StorageError> {
        self.tables
            .write()
            .live
            .insert(live.station_code.clone(), live.clone());
        Ok(())
    }

    async fn store_image(&self, image: &ImageRow) -> Result<bool, StorageError> {
        let mut tables = self.tables.write();
        let exists = tables.images.values().any(|i| {
            i.source_code == image.source_code
                && i.type_code == image.type_code
                && i.timestamp == image.timestamp
        });
        if exists {
            return Ok(false);
        }

        tables.next_image_id += 1;
        let id = tables.next_image_id;
        tables.images.insert(id, ImageRow { id, ..image.clone() });
        Ok(true)
    }
}

#[async_trait]
impl StationStore for MemoryStore {
    async fn local_stations(&self) -> Result<Vec<StationRecord>, StorageError> {
        Ok(self.tables.read().stations.values().cloned().collect())
    }

    async fn samples_after(
        &self,
        station: &Code,
        after: Timestamp,
        limit: usize,
    ) -> Result<Vec<SampleRow>, StorageError> {
        let start = Timestamp::from_unix(after.as_unix().saturating_add(1));
        if start == after {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .read()
            .samples
            .range((station.clone(), start)..)
            .take_while(|((code, _), _)| code == station)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn latest_live(&self, station: &Code) -> Result<Option<LiveRow>, StorageError> {
        Ok(self.live(station))
    }

    async fn load_watermark(
        &self,
        site_id: i32,
        station: &Code,
    ) -> Result<Option<Timestamp>, StorageError> {
        Ok(self
            .tables
            .read()
            .watermarks
            .get(&(site_id, station.clone()))
            .copied())
    }

    async fn save_watermark(
        &self,
        site_id: i32,
        station: &Code,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let entry = tables
            .watermarks
            .entry((site_id, station.clone()))
            .or_insert(timestamp);
        *entry = (*entry).max(timestamp);
        Ok(())
    }

    async fn insert_image(&self, image: &ImageRow, sites: &[i32]) -> Result<i64, StorageError> {
        let mut tables = self.tables.write();
        tables.next_image_id += 1;
        let id = tables.next_image_id;
        tables.images.insert(id, ImageRow { id, ..image.clone() });

        for &site_id in sites {
            tables.replication.insert(
                (site_id, id),
                ReplicationStatus {
                    image_id: id,
                    site_id,
                    status: ReplicationState::Pending,
                    retries: 0,
                    status_time: Timestamp::now().as_unix(),
                },
            );
        }
        Ok(id)
    }

    async fn image(&self, image_id: i64) -> Result<Option<ImageRow>, StorageError> {
        Ok(self.tables.read().images.get(&image_id).cloned())
    }

    async fn find_image(
        &self,
        source: &Code,
        image_type: &Code,
        timestamp: Timestamp,
    ) -> Result<Option<i64>, StorageError> {
        Ok(self
            .tables
            .read()
            .images
            .values()
            .find(|i| {
                &i.source_code == source && &i.type_code == image_type && i.timestamp == timestamp
            })
            .map(|i| i.id))
    }

    async fn select_pending(
        &self,
        site_id: i32,
        retry_limit: u32,
        limit: usize,
    ) -> Result<Vec<ReplicationStatus>, StorageError> {
        let tables = self.tables.read();
        let mut rows: Vec<ReplicationStatus> = tables
            .replication
            .values()
            .filter(|r| {
                r.site_id == site_id
                    && r.status == ReplicationState::Pending
                    && r.retries < retry_limit
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.status_time, r.image_id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn set_status(
        &self,
        site_id: i32,
        image_id: i64,
        status: ReplicationState,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let row = tables
            .replication
            .get_mut(&(site_id, image_id))
            .ok_or_else(|| StorageError::NotFound(format!("image {image_id} for site {site_id}")))?;
        row.status = status;
        row.status_time = now.as_unix();
        Ok(())
    }

    async fn expire_awaiting(
        &self,
        site_id: i32,
        cutoff: Timestamp,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        let mut tables = self.tables.write();
        let mut moved = 0;
        for row in tables.replication.values_mut() {
            if row.site_id == site_id
                && row.status == ReplicationState::AwaitingConfirmation
                && row.status_time < cutoff.as_unix()
            {
                row.status = ReplicationState::Pending;
                row.retries += 1;
                row.status_time = now.as_unix();
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn reset_retries(
        &self,
        site_id: i32,
        image_id: Option<i64>,
    ) -> Result<u64, StorageError> {
        let mut tables = self.tables.write();
        let mut reset = 0;
        for row in tables.replication.values_mut() {
            if row.site_id == site_id && image_id.is_none_or(|id| id == row.image_id) {
                row.retries = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn parked(
        &self,
        site_id: i32,
        retry_limit: u32,
    ) -> Result<Vec<ReplicationStatus>, StorageError> {
        Ok(self
            .tables
            .read()
            .replication
            .values()
            .filter(|r| {
                r.site_id == site_id
                    && r.status != ReplicationState::Done
                    && r.retries >= retry_limit
            })
            .cloned()
            .collect())
    }

    async fn summary(
        &self,
        site_id: i32,
        retry_limit: u32,
    ) -> Result<ReplicationSummary, StorageError> {
        let tables = self.tables.read();
        let mut summary = ReplicationSummary {
            site_id,
            ..Default::default()
        };
        for row in tables.replication.values().filter(|r| r.site_id == site_id) {
            match row.status {
                ReplicationState::Pending => summary.pending += 1,
                ReplicationState::AwaitingConfirmation => summary.awaiting_confirmation += 1,
                ReplicationState::Done => summary.done += 1,
            }
            if row.status != ReplicationState::Done && row.retries >= retry_limit {
                summary.parked += 1;
            }
        }
        Ok(summary)
    }
}
