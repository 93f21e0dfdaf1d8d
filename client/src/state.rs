//! Upload progress that outlives a single connection

use crate::notify::LiveReading;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wxpush_protocol::{
    Code, DeltaEncoding, FieldLayout, FieldValues, HardwareType, ImageAck, ImagePacket, LiveBase,
    LiveDataRecord, LiveSequencer, MAX_COMPRESSED_LIVE_RECORDS, RecordKind, SampleBase,
    SampleDataRecord, SequenceId, Timestamp, WeatherRecord, encode_live, encode_sample,
};
use wxpush_replication::{IdentityTable, ImageReplicator, SampleTracker};
use wxpush_storage::StationStore;

pub struct UploadState {
    store: Arc<dyn StationStore>,
    site_id: i32,
    sample_batch_size: usize,
    samples: SampleTracker,
    /// Stations whose persisted watermark has been loaded
    restored: HashSet<Code>,
    images: Arc<ImageReplicator>,
    live: LiveSequencer,

    compress: bool,
    /// Diff each sample in a batch against the one before it
    chain_samples: bool,
    /// Newest sample per station the server has acknowledged
    confirmed: HashMap<Code, Timestamp>,
    /// Field values of the confirmed sample, `None` if it isn't stored locally
    sample_bases: HashMap<Code, (Timestamp, Option<FieldValues>)>,
    previous_live: HashMap<Code, (SequenceId, FieldValues)>,
    /// Compressed live records since the last full one
    compressed_live: u32,
}

impl UploadState {
    /// Build the state, restoring persisted sample watermarks
    pub async fn new(
        store: Arc<dyn StationStore>,
        images: Arc<ImageReplicator>,
        sample_batch_size: usize,
        sample_resend: Duration,
    ) -> Result<Self> {
        let mut state = Self {
            site_id: images.site_id(),
            store,
            sample_batch_size,
            samples: SampleTracker::new(sample_resend),
            restored: HashSet::new(),
            images,
            live: LiveSequencer::new(),
            compress: false,
            chain_samples: false,
            confirmed: HashMap::new(),
            sample_bases: HashMap::new(),
            previous_live: HashMap::new(),
            compressed_live: 0,
        };
        for station in state.store.local_stations().await? {
            state.restore(&station.code).await?;
        }
        Ok(state)
    }

    /// Enable delta encoding. Samples are chained within a batch only when
    /// the transport delivers them in order.
    pub fn with_delta_encoding(mut self, compress: bool, chain_samples: bool) -> Self {
        self.compress = compress;
        self.chain_samples = chain_samples;
        self
    }

    async fn restore(&mut self, station: &Code) -> Result<()> {
        if !self.restored.insert(station.clone()) {
            return Ok(());
        }
        if let Some(watermark) = self.store.load_watermark(self.site_id, station).await? {
            debug!(%station, watermark = watermark.as_unix(), "Restored watermark");
            self.samples.restore(station, watermark);
            self.confirmed.insert(station.clone(), watermark);
        }
        Ok(())
    }

    pub fn images(&self) -> &Arc<ImageReplicator> {
        &self.images
    }

    pub fn samples(&self) -> &SampleTracker {
        &self.samples
    }

    /// Forget per-connection progress after a reconnect
    pub fn reset_session(&mut self) {
        self.samples.reset_session();
        self.live.reset();
        self.previous_live.clear();
        self.compressed_live = 0;
    }

    /// Load the field values of the confirmed sample for `station` into the
    /// cache and return them
    async fn sample_base(
        &mut self,
        station: &Code,
        hardware: HardwareType,
    ) -> Result<Option<(Timestamp, FieldValues)>> {
        let Some(confirmed) = self.confirmed.get(station).copied() else {
            return Ok(None);
        };

        let cached = self
            .sample_bases
            .get(station)
            .filter(|(timestamp, _)| *timestamp == confirmed);
        if let Some((timestamp, values)) = cached {
            return Ok(values.clone().map(|values| (*timestamp, values)));
        }

        let after = Timestamp::from_unix(confirmed.as_unix().saturating_sub(1));
        let row = self
            .store
            .samples_after(station, after, 1)
            .await?
            .into_iter()
            .find(|row| row.timestamp == confirmed);
        let layout = FieldLayout::new(hardware, RecordKind::Sample);
        let values = row.and_then(|row| {
            FieldValues::split(&layout, row.field_list, &row.field_data)
                .map_err(|e| debug!(%station, "Confirmed sample unusable as a base: {}", e))
                .ok()
        });

        self.sample_bases
            .insert(station.clone(), (confirmed, values.clone()));
        Ok(values.map(|values| (confirmed, values)))
    }

    /// Samples not yet sent or acknowledged, for every station the server
    /// issued an id for. They are marked in flight.
    pub async fn collect_samples(&mut self, identity: &IdentityTable) -> Result<Vec<WeatherRecord>> {
        let now = Instant::now();
        let mut records = Vec::new();
        let codes: Vec<Code> = identity.station_codes().cloned().collect();

        for code in codes {
            let (Some(station_id), Some(hardware)) =
                (identity.station_id(&code), identity.hardware(&code))
            else {
                continue;
            };
            self.restore(&code).await?;
            let after = self.samples.next_after(&code);
            let rows = self
                .store
                .samples_after(&code, after, self.sample_batch_size)
                .await?;
            if rows.is_empty() {
                continue;
            }

            let layout = FieldLayout::new(hardware, RecordKind::Sample);
            let mut base = if self.compress {
                self.sample_base(&code, hardware).await?
            } else {
                None
            };

            for row in rows {
                self.samples.mark_sent(&code, row.timestamp, now);

                let split = if self.compress {
                    FieldValues::split(&layout, row.field_list, &row.field_data).ok()
                } else {
                    None
                };
                let (field_list, field_data) = match split {
                    Some(values) => {
                        let encoded = encode_sample(
                            &values,
                            base.as_ref().map(|(timestamp, values)| SampleBase {
                                timestamp: *timestamp,
                                values,
                            }),
                        );
                        if self.chain_samples {
                            base = Some((row.timestamp, values));
                        }
                        (encoded.field_list, encoded.field_data)
                    }
                    None => (row.field_list, row.field_data),
                };

                records.push(WeatherRecord::Sample(SampleDataRecord {
                    station_id,
                    timestamp: row.timestamp,
                    download_timestamp: row.download_timestamp,
                    field_list,
                    field_data,
                }));
            }
        }

        if !records.is_empty() {
            debug!(count = records.len(), "Collected samples to send");
        }
        Ok(records)
    }

    /// Live record for a reading. `None` if the server didn't issue an id for
    /// its station, or if it is unchanged since the previous one and so is
    /// skipped.
    pub async fn live_record(
        &mut self,
        identity: &IdentityTable,
        reading: LiveReading,
    ) -> Result<Option<WeatherRecord>> {
        let (Some(station_id), Some(hardware)) = (
            identity.station_id(&reading.station),
            identity.hardware(&reading.station),
        ) else {
            debug!(station = %reading.station, "No station id for live reading");
            return Ok(None);
        };

        let live_layout = FieldLayout::new(hardware, RecordKind::Live);
        let sample_layout = FieldLayout::new(hardware, RecordKind::Sample);
        let values = match FieldValues::split(&live_layout, reading.field_list, &reading.field_data) {
            Ok(values) => values,
            Err(e) => {
                warn!(station = %reading.station, "Live reading doesn't match its layout: {}", e);
                return Ok(None);
            }
        };

        let compress = self.compress && self.compressed_live < MAX_COMPRESSED_LIVE_RECORDS;
        let sample = if compress {
            self.sample_base(&reading.station, hardware).await?
        } else {
            None
        };
        let encoded = encode_live(
            &values,
            &live_layout,
            &sample_layout,
            self.previous_live
                .get(&reading.station)
                .map(|(sequence, values)| LiveBase {
                    sequence: *sequence,
                    values,
                }),
            sample.as_ref().map(|(timestamp, values)| SampleBase {
                timestamp: *timestamp,
                values,
            }),
            compress,
        );

        if encoded.encoding == DeltaEncoding::None {
            self.compressed_live = 0;
        } else {
            self.compressed_live += 1;
        }
        if encoded.encoding == DeltaEncoding::Skip {
            debug!(station = %reading.station, "Live reading unchanged, skipped");
            return Ok(None);
        }

        let sequence_id = self.live.advance();
        self.previous_live
            .insert(reading.station, (sequence_id, values));
        Ok(Some(WeatherRecord::Live(LiveDataRecord {
            station_id,
            sequence_id,
            field_list: encoded.field_list,
            field_data: encoded.field_data,
        })))
    }

    /// Record a sample acknowledgement and persist the watermark if it moved
    pub async fn acknowledge_sample(&mut self, station: &Code, timestamp: Timestamp) -> Result<()> {
        if self.samples.is_in_flight(station, timestamp) {
            let confirmed = self.confirmed.entry(station.clone()).or_default();
            *confirmed = (*confirmed).max(timestamp);
        }
        if let Some(watermark) = self.samples.acknowledge(station, timestamp) {
            self.store
                .save_watermark(self.site_id, station, watermark)
                .await?;
        }
        Ok(())
    }

    /// Drop samples the server never acknowledged so they are sent again
    pub fn expire_stale(&mut self) -> usize {
        self.samples.expire_stale(Instant::now())
    }

    /// Next images to send, converted to packets. Images whose type or source
    /// the server doesn't know stay awaiting confirmation and are retried
    /// after the timeout.
    pub async fn collect_images(&self, identity: &IdentityTable) -> Result<Vec<ImagePacket>> {
        let rows = self.images.next_batch(Timestamp::now()).await?;
        let mut packets = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(image_type_id), Some(image_source_id)) = (
                identity.image_type_id(&row.type_code),
                identity.image_source_id(&row.source_code),
            ) else {
                warn!(
                    image = row.id,
                    source = %row.source_code,
                    image_type = %row.type_code,
                    "Server has no id for this image's source or type"
                );
                continue;
            };
            packets.push(ImagePacket {
                image_type_id,
                image_source_id,
                timestamp: row.timestamp,
                title: row.title,
                description: row.description,
                mime_type: row.mime_type,
                metadata: row.metadata,
                data: row.data,
            });
        }
        Ok(packets)
    }

    pub async fn acknowledge_image(&self, identity: &IdentityTable, ack: ImageAck) -> Result<()> {
        let (Some(source), Some(image_type)) = (
            identity.image_source_code(ack.image_source_id),
            identity.image_type_code(ack.image_type_id),
        ) else {
            warn!(
                image_source_id = ack.image_source_id,
                image_type_id = ack.image_type_id,
                "Image acknowledgement with unknown ids"
            );
            return Ok(());
        };

        match self.store.find_image(source, image_type, ack.timestamp).await? {
            Some(image_id) => {
                self.images.acknowledge(image_id, Timestamp::now()).await?;
                info!(image = image_id, source = %source, "Image confirmed");
            }
            None => warn!(source = %source, "Acknowledgement for an image we don't have"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wxpush_protocol::{CodeMapping, FieldList, StationEntry, StationId, StationInfo};
    use wxpush_replication::ReplicationPolicy;
    use wxpush_storage::{ImageRow, MemoryStore, ReplicationState, SampleRow};

    fn code(s: &str) -> Code {
        Code::new(s).unwrap()
    }

    fn sample(ts: u32) -> SampleRow {
        SampleRow {
            station_code: code("rua"),
            timestamp: Timestamp::from_unix(ts),
            download_timestamp: Timestamp::from_unix(ts),
            field_list: FieldList::from_ids([2]).unwrap(),
            field_data: Bytes::from_static(&[1]),
        }
    }

    fn identity() -> IdentityTable {
        let mut table = IdentityTable::new();
        table.load(&StationInfo {
            stations: vec![StationEntry {
                code: code("rua"),
                hardware: HardwareType::Generic,
                station_id: StationId::new(3),
            }],
            image_types: vec![CodeMapping {
                code: code("CAM"),
                id: 1,
            }],
            image_sources: vec![CodeMapping {
                code: code("cam1"),
                id: 2,
            }],
        });
        table
    }

    async fn state(store: Arc<MemoryStore>) -> UploadState {
        let images = Arc::new(ImageReplicator::new(store.clone(), 1, ReplicationPolicy::default()));
        UploadState::new(store, images, 100, Duration::from_secs(300))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_samples_sent_once_until_reconnect() {
        let store = MemoryStore::new();
        store.add_sample(sample(100));
        store.add_sample(sample(200));
        let mut state = state(store.clone()).await;
        let identity = identity();

        let records = state.collect_samples(&identity).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].station_id(), StationId::new(3));
        assert!(state.collect_samples(&identity).await.unwrap().is_empty());

        state.acknowledge_sample(&code("rua"), Timestamp::from_unix(100)).await.unwrap();
        state.reset_session();
        let records = state.collect_samples(&identity).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_persisted_and_restored() {
        let store = MemoryStore::new();
        store.add_sample(sample(100));
        let mut state = state(store.clone()).await;
        let identity = identity();
        state.collect_samples(&identity).await.unwrap();
        state.acknowledge_sample(&code("rua"), Timestamp::from_unix(100)).await.unwrap();

        // A restarted uploader starts after the acknowledged sample
        let mut restarted = self::state(store).await;
        assert!(restarted.collect_samples(&identity).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_sequence_resets_with_session() {
        let store = MemoryStore::new();
        let mut state = state(store).await;
        let identity = identity();
        let reading = LiveReading {
            station: code("rua"),
            field_list: FieldList::from_ids([2]).unwrap(),
            field_data: Bytes::from_static(&[4]),
        };

        let seq = |r: Option<WeatherRecord>| match r {
            Some(WeatherRecord::Live(live)) => live.sequence_id.get(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(seq(state.live_record(&identity, reading.clone()).await.unwrap()), 0);
        assert_eq!(seq(state.live_record(&identity, reading.clone()).await.unwrap()), 1);
        state.reset_session();
        assert_eq!(seq(state.live_record(&identity, reading.clone()).await.unwrap()), 0);

        let unknown = LiveReading {
            station: code("zzz"),
            ..reading
        };
        assert!(state.live_record(&identity, unknown).await.unwrap().is_none());
    }

    /// indoor_humidity, indoor_temperature, temperature, humidity, pressure
    const READING_FIELDS: [u8; 5] = [2, 3, 4, 5, 6];

    fn reading_data(temperature: i16) -> Bytes {
        let mut data = vec![40, 0, 200];
        data.extend_from_slice(&temperature.to_be_bytes());
        data.push(70);
        data.extend_from_slice(&10130u16.to_be_bytes());
        Bytes::from(data)
    }

    fn weather_sample(ts: u32, temperature: i16) -> SampleRow {
        SampleRow {
            station_code: code("rua"),
            timestamp: Timestamp::from_unix(ts),
            download_timestamp: Timestamp::from_unix(ts),
            field_list: FieldList::from_ids(READING_FIELDS).unwrap(),
            field_data: reading_data(temperature),
        }
    }

    fn live_reading(temperature: i16) -> LiveReading {
        LiveReading {
            station: code("rua"),
            field_list: FieldList::from_ids(READING_FIELDS).unwrap(),
            field_data: reading_data(temperature),
        }
    }

    fn live(record: Option<WeatherRecord>) -> LiveDataRecord {
        match record {
            Some(WeatherRecord::Live(live)) => live,
            other => panic!("expected a live record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unchanged_live_skipped() {
        let store = MemoryStore::new();
        let mut state = state(store).await.with_delta_encoding(true, true);
        let identity = identity();

        let first = live(state.live_record(&identity, live_reading(215)).await.unwrap());
        assert_eq!(DeltaEncoding::of(first.field_list), DeltaEncoding::None);

        // Identical reading: nothing sent, no sequence id used
        assert!(state.live_record(&identity, live_reading(215)).await.unwrap().is_none());

        let changed = live(state.live_record(&identity, live_reading(216)).await.unwrap());
        assert_eq!(changed.sequence_id.get(), 1);
        assert_eq!(DeltaEncoding::of(changed.field_list), DeltaEncoding::LiveDiff);
        // temperature + the base sequence id
        assert_eq!(changed.field_data.len(), 4);
        assert_eq!(&changed.field_data[..2], &[0, 0]);
    }

    #[tokio::test]
    async fn test_full_live_forced_after_compressed_run() {
        let store = MemoryStore::new();
        let mut state = state(store).await.with_delta_encoding(true, true);
        let identity = identity();

        let mut encodings = Vec::new();
        for i in 0..=(MAX_COMPRESSED_LIVE_RECORDS as i16 + 1) {
            let record = live(state.live_record(&identity, live_reading(200 + i)).await.unwrap());
            encodings.push(DeltaEncoding::of(record.field_list));
        }
        assert_eq!(encodings[0], DeltaEncoding::None);
        assert!(encodings[1..=30].iter().all(|e| *e == DeltaEncoding::LiveDiff));
        assert_eq!(encodings[31], DeltaEncoding::None);
    }

    #[tokio::test]
    async fn test_samples_chained_and_live_diffed_against_confirmed() {
        let store = MemoryStore::new();
        store.add_sample(weather_sample(100, 215));
        store.add_sample(weather_sample(200, 216));
        let mut state = state(store).await.with_delta_encoding(true, true);
        let identity = identity();

        let records = state.collect_samples(&identity).await.unwrap();
        let encodings: Vec<_> = records
            .iter()
            .map(|r| DeltaEncoding::of(r.field_list()))
            .collect();
        assert_eq!(encodings, vec![DeltaEncoding::None, DeltaEncoding::SampleDiff]);
        // Based on the sample before it in the batch
        let data = records[1].field_data();
        assert_eq!(&data[..4], &100u32.to_be_bytes());

        // Nothing confirmed yet, so the live record can't use a sample
        let first = live(state.live_record(&identity, live_reading(230)).await.unwrap());
        assert_eq!(DeltaEncoding::of(first.field_list), DeltaEncoding::None);

        state.acknowledge_sample(&code("rua"), Timestamp::from_unix(200)).await.unwrap();
        state.reset_session();
        let next = live(state.live_record(&identity, live_reading(231)).await.unwrap());
        assert_eq!(DeltaEncoding::of(next.field_list), DeltaEncoding::SampleDiff);
        assert_eq!(&next.field_data[..4], &200u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_late_ack_not_used_as_base() {
        let store = MemoryStore::new();
        store.add_sample(weather_sample(100, 215));
        let mut state = state(store).await.with_delta_encoding(true, true);
        let identity = identity();

        // Acknowledged without ever being in flight
        state.acknowledge_sample(&code("rua"), Timestamp::from_unix(100)).await.unwrap();
        let record = live(state.live_record(&identity, live_reading(216)).await.unwrap());
        assert_eq!(DeltaEncoding::of(record.field_list), DeltaEncoding::None);
    }

    #[tokio::test]
    async fn test_image_round_trip() {
        let store = MemoryStore::new();
        let image_id = store
            .insert_image(
                &ImageRow {
                    id: 0,
                    source_code: code("cam1"),
                    type_code: code("CAM"),
                    timestamp: Timestamp::from_unix(700),
                    title: "t".into(),
                    description: String::new(),
                    mime_type: "image/png".into(),
                    metadata: String::new(),
                    data: Bytes::from_static(b"png"),
                },
                &[1],
            )
            .await
            .unwrap();
        let state = state(store.clone()).await;
        let identity = identity();

        let packets = state.collect_images(&identity).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!((packets[0].image_type_id, packets[0].image_source_id), (1, 2));
        assert_eq!(
            store.replication_status(1, image_id).unwrap().status,
            ReplicationState::AwaitingConfirmation
        );

        state
            .acknowledge_image(
                &identity,
                ImageAck {
                    timestamp: Timestamp::from_unix(700),
                    image_source_id: 2,
                    image_type_id: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.replication_status(1, image_id).unwrap().status,
            ReplicationState::Done
        );
    }
}
