//! Rebuilding delta-encoded records
//!
//! Each connection remembers the last few live records and samples it decoded
//! per station. A record diffed against one of them is patched back to its
//! full field set. Sample bases missing from the cache are read from the
//! archive; a base found in neither makes the record undecodable.

use std::collections::{HashMap, VecDeque};
use wxpush_protocol::{
    DeltaEncoding, FieldLayout, FieldValues, LostLiveCount, RecordKind, SequenceId,
    StationEntry, StationId, Timestamp, patch_from_base, patch_live_from_sample,
};
use wxpush_replication::{LiveLossTracker, LiveVerdict};
use wxpush_storage::{ArchiveStore, StorageError};

/// Records remembered per station as patch bases
pub const CACHE_DEPTH: usize = 5;

/// A record rebuilt to its full field set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub encoding: DeltaEncoding,

    /// Field data bytes as received
    pub received_size: usize,

    pub values: FieldValues,
}

type Cache<K> = HashMap<StationId, VecDeque<(K, FieldValues)>>;

fn remember<K>(cache: &mut Cache<K>, station: StationId, key: K, values: FieldValues) {
    let entries = cache.entry(station).or_default();
    entries.push_back((key, values));
    if entries.len() > CACHE_DEPTH {
        entries.pop_front();
    }
}

fn lookup<K: PartialEq>(cache: &Cache<K>, station: StationId, key: K) -> Option<&FieldValues> {
    cache
        .get(&station)?
        .iter()
        .rev()
        .find(|(k, _)| *k == key)
        .map(|(_, values)| values)
}

/// Per-connection decoding state
#[derive(Debug, Default)]
pub struct RecordDecoder {
    live: LiveLossTracker,
    live_cache: Cache<SequenceId>,
    sample_cache: Cache<Timestamp>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_live(&mut self, station: StationId, sequence: SequenceId) -> LiveVerdict {
        self.live.observe(station, sequence)
    }

    pub fn lost_live(&self) -> LostLiveCount {
        self.live.lost()
    }

    /// Forget everything for a new session
    pub fn reset(&mut self) {
        self.live.reset();
        self.live_cache.clear();
        self.sample_cache.clear();
    }

    /// Rebuild a sample. `None` if it was diffed against a sample this
    /// server doesn't have.
    pub async fn decode_sample(
        &mut self,
        store: &dyn ArchiveStore,
        station: &StationEntry,
        timestamp: Timestamp,
        received: FieldValues,
    ) -> Result<Option<Decoded>, StorageError> {
        let received_size = received.encoded_len();
        let encoding = DeltaEncoding::of(received.field_list());

        let values = match received.sample_diff_base() {
            Some(base) if encoding == DeltaEncoding::SampleDiff => {
                match self.sample_base(store, station, base).await? {
                    Some(base) => patch_from_base(&received, &base),
                    None => return Ok(None),
                }
            }
            _ => received,
        };

        remember(&mut self.sample_cache, station.station_id, timestamp, values.clone());
        Ok(Some(Decoded {
            encoding,
            received_size,
            values,
        }))
    }

    /// Rebuild a live record. `None` if its base is unknown, in which case it
    /// also counts as lost.
    pub async fn decode_live(
        &mut self,
        store: &dyn ArchiveStore,
        station: &StationEntry,
        sequence: SequenceId,
        received: FieldValues,
    ) -> Result<Option<Decoded>, StorageError> {
        let received_size = received.encoded_len();
        let encoding = DeltaEncoding::of(received.field_list());

        let values = match encoding {
            DeltaEncoding::LiveDiff => received
                .live_diff_base()
                .and_then(|base| lookup(&self.live_cache, station.station_id, base))
                .map(|base| patch_from_base(&received, base)),
            DeltaEncoding::SampleDiff => match received.sample_diff_base() {
                Some(base) => self.sample_base(store, station, base).await?.map(|base| {
                    patch_live_from_sample(
                        &received,
                        &base,
                        &FieldLayout::new(station.hardware, RecordKind::Live),
                        &FieldLayout::new(station.hardware, RecordKind::Sample),
                    )
                }),
                None => None,
            },
            _ => Some(received),
        };

        let Some(values) = values else {
            self.live.record_undecodable();
            return Ok(None);
        };
        remember(&mut self.live_cache, station.station_id, sequence, values.clone());
        Ok(Some(Decoded {
            encoding,
            received_size,
            values,
        }))
    }

    async fn sample_base(
        &self,
        store: &dyn ArchiveStore,
        station: &StationEntry,
        timestamp: Timestamp,
    ) -> Result<Option<FieldValues>, StorageError> {
        if let Some(values) = lookup(&self.sample_cache, station.station_id, timestamp) {
            return Ok(Some(values.clone()));
        }

        let Some(row) = store.sample(&station.code, timestamp).await? else {
            return Ok(None);
        };
        let layout = FieldLayout::new(station.hardware, RecordKind::Sample);
        Ok(FieldValues::split(&layout, row.field_list, &row.field_data).ok())
    }
}
