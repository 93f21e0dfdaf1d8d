//! Per-connection archive session
//!
//! A session turns decoded packets into store writes and replies. One task
//! owns each session, so packets for a connection are handled in order.

use crate::decoder::RecordDecoder;
use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use wxpush_protocol::{
    FieldLayout, FieldValues, ImageAck, ImagePacket, MAX_ENTRIES, RecordKind, SampleAck,
    TcpPacket, Timestamp, WeatherRecord,
};
use wxpush_replication::{IdentityRegistry, LiveVerdict, SessionIdentity};
use wxpush_storage::{ArchiveStore, ImageRow, LiveRow, SampleRow, StorageError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Shared by every session on the server
pub struct ServerContext {
    pub store: Arc<dyn ArchiveStore>,
    pub identities: Arc<IdentityRegistry>,
    pub metrics: Arc<Metrics>,
}

impl ServerContext {
    pub fn new(store: Arc<dyn ArchiveStore>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            store,
            identities: IdentityRegistry::new(),
            metrics,
        })
    }

    /// Issue a fresh identity snapshot, or `None` if the code is not authorised
    pub async fn authenticate(&self, auth_code: u64) -> Result<Option<SessionIdentity>, SessionError> {
        if !self.store.authorise(auth_code).await? {
            self.metrics.auth_failures.inc();
            return Ok(None);
        }

        let stations = self.store.stations_for(auth_code).await?;
        let image_types = self.store.image_types().await?;
        let image_sources = self.store.image_sources_for(auth_code).await?;
        Ok(Some(self.identities.issue(
            auth_code,
            &stations,
            &image_types,
            &image_sources,
        )))
    }

    /// Archive received records, patching delta-encoded ones back to full
    /// field sets first. Returns acknowledgements for every sample that is
    /// now stored, including ones that were already present.
    pub async fn ingest_records(
        &self,
        identity: &SessionIdentity,
        decoder: &mut RecordDecoder,
        records: Vec<WeatherRecord>,
    ) -> Result<Vec<SampleAck>, SessionError> {
        let mut samples = Vec::new();
        let mut acks = Vec::new();

        for record in records {
            let Some(station) = identity.station(record.station_id()) else {
                warn!(
                    station_id = %record.station_id(),
                    "Dropping record for station id not issued to this session"
                );
                continue;
            };
            let layout = FieldLayout::new(station.hardware, record.kind());
            let received = match FieldValues::split(&layout, record.field_list(), record.field_data()) {
                Ok(values) => values,
                Err(e) => {
                    warn!(station = %station.code, "Dropping record with bad field data: {}", e);
                    self.metrics.malformed_packets.inc();
                    continue;
                }
            };

            match record {
                WeatherRecord::Sample(sample) => {
                    let decoded = decoder
                        .decode_sample(self.store.as_ref(), station, sample.timestamp, received)
                        .await?;
                    let Some(decoded) = decoded else {
                        warn!(
                            station = %station.code,
                            timestamp = sample.timestamp.as_unix(),
                            "Dropping sample diffed against an unknown sample"
                        );
                        self.metrics.undecodable_sample_records.inc();
                        continue;
                    };
                    self.metrics.record_received(
                        RecordKind::Sample,
                        decoded.encoding,
                        decoded.received_size,
                        decoded.values.encoded_len(),
                    );

                    acks.push(SampleAck {
                        timestamp: sample.timestamp,
                        station_id: sample.station_id,
                    });
                    samples.push(SampleRow {
                        station_code: station.code.clone(),
                        timestamp: sample.timestamp,
                        download_timestamp: sample.download_timestamp,
                        field_list: decoded.values.field_list(),
                        field_data: decoded.values.encode(),
                    });
                }
                WeatherRecord::Live(record) => {
                    if decoder.observe_live(record.station_id, record.sequence_id) == LiveVerdict::Discard {
                        continue;
                    }
                    let decoded = decoder
                        .decode_live(self.store.as_ref(), station, record.sequence_id, received)
                        .await?;
                    let Some(decoded) = decoded else {
                        debug!(
                            station = %station.code,
                            sequence_id = %record.sequence_id,
                            "Dropping live record diffed against an unknown record"
                        );
                        self.metrics.undecodable_live_records.inc();
                        continue;
                    };
                    self.metrics.record_received(
                        RecordKind::Live,
                        decoded.encoding,
                        decoded.received_size,
                        decoded.values.encoded_len(),
                    );

                    self.store
                        .store_live(&LiveRow {
                            station_code: station.code.clone(),
                            sequence_id: record.sequence_id,
                            field_list: decoded.values.field_list(),
                            field_data: decoded.values.encode(),
                            received_at: Timestamp::now(),
                        })
                        .await?;
                    self.metrics.live_records.inc();
                }
            }
        }

        if !samples.is_empty() {
            let added = self.store.store_samples(&samples).await?;
            self.metrics.samples_stored.inc_by(added);
            self.metrics
                .duplicate_samples
                .inc_by((samples.len() as u64).saturating_sub(added));
            debug!(received = samples.len(), added, "Archived samples");
        }
        Ok(acks)
    }

    /// Archive an image. Returns the acknowledgement, or `None` if the packet
    /// names ids this session was not issued.
    pub async fn ingest_image(
        &self,
        identity: &SessionIdentity,
        image: ImagePacket,
    ) -> Result<Option<ImageAck>, SessionError> {
        let (Some(type_code), Some(source_code)) = (
            identity.image_type(image.image_type_id),
            identity.image_source(image.image_source_id),
        ) else {
            warn!(
                image_type_id = image.image_type_id,
                image_source_id = image.image_source_id,
                "Dropping image with ids not issued to this session"
            );
            return Ok(None);
        };

        let ack = ImageAck {
            timestamp: image.timestamp,
            image_source_id: image.image_source_id,
            image_type_id: image.image_type_id,
        };
        let row = ImageRow {
            id: 0,
            source_code: source_code.clone(),
            type_code: type_code.clone(),
            timestamp: image.timestamp,
            title: image.title,
            description: image.description,
            mime_type: image.mime_type,
            metadata: image.metadata,
            data: image.data,
        };
        if self.store.store_image(&row).await? {
            self.metrics.images_stored.inc();
            debug!(source = %row.source_code, image_type = %row.type_code, "Archived image");
        } else {
            self.metrics.duplicate_images.inc();
            debug!(source = %row.source_code, "Image already archived");
        }
        Ok(Some(ack))
    }
}

/// State of one TCP connection
pub struct ServerSession {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    identity: Option<SessionIdentity>,
    decoder: RecordDecoder,
}

impl ServerSession {
    pub fn new(ctx: Arc<ServerContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            identity: None,
            decoder: RecordDecoder::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    /// Process one packet and return the replies to send, in order
    pub async fn handle(&mut self, packet: TcpPacket) -> Result<Vec<TcpPacket>, SessionError> {
        match packet {
            TcpPacket::Authenticate { auth_code } => {
                // A failed attempt revokes any earlier success
                self.identity = None;
                self.decoder.reset();

                match self.ctx.authenticate(auth_code).await? {
                    Some(identity) => {
                        info!(
                            peer = %self.peer,
                            auth_code,
                            stations = identity.stations().len(),
                            "Client authenticated"
                        );
                        let info = identity.to_station_info();
                        self.identity = Some(identity);
                        Ok(vec![TcpPacket::StationInfo(info)])
                    }
                    None => {
                        warn!(peer = %self.peer, "Authentication failed");
                        Ok(vec![TcpPacket::AuthenticateFailed])
                    }
                }
            }
            TcpPacket::WeatherData { records } => {
                let Some(identity) = &self.identity else {
                    warn!(peer = %self.peer, "Dropping weather data from unauthenticated client");
                    return Ok(Vec::new());
                };
                let acks = self
                    .ctx
                    .ingest_records(identity, &mut self.decoder, records)
                    .await?;
                Ok(acks
                    .chunks(MAX_ENTRIES)
                    .map(|chunk| TcpPacket::SampleAcknowledgement {
                        acks: chunk.to_vec(),
                    })
                    .collect())
            }
            TcpPacket::Image(image) => {
                let Some(identity) = &self.identity else {
                    warn!(peer = %self.peer, "Dropping image from unauthenticated client");
                    return Ok(Vec::new());
                };
                Ok(self
                    .ctx
                    .ingest_image(identity, image)
                    .await?
                    .map(|ack| TcpPacket::ImageAcknowledgement { acks: vec![ack] })
                    .into_iter()
                    .collect())
            }
            other => {
                warn!(
                    peer = %self.peer,
                    "Ignoring {} packet, only sent by servers",
                    other.packet_type()
                );
                Ok(Vec::new())
            }
        }
    }
}
