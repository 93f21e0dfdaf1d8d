//! One connection to the archive server over a byte stream
//!
//! The session authenticates, waits for the station table and then pushes
//! samples, live records and images until the stream closes or shutdown is
//! requested. Socket reads, hints and timers are multiplexed on one task so
//! state changes for the connection never interleave.

use crate::notify::Notification;
use crate::state::UploadState;
use anyhow::{Result, anyhow};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};
use wxpush_protocol::{MAX_WEATHER_DATA_SIZE, TcpPacket, WeatherRecord, record_frame_size};
use wxpush_replication::IdentityTable;
use wxpush_transport::{TcpFramer, write_packet};

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the connection
    Disconnected,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub auth_code: u64,
    pub auth_timeout: Duration,
    pub transmit_interval: Duration,
}

pub struct TcpSession<'a, S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    framer: TcpFramer,
    identity: IdentityTable,
    state: &'a mut UploadState,
    settings: SessionSettings,
}

impl<'a, S> TcpSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S, state: &'a mut UploadState, settings: SessionSettings) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            framer: TcpFramer::new(),
            identity: IdentityTable::new(),
            state,
            settings,
        }
    }

    pub async fn run(
        mut self,
        notifications: &mut mpsc::Receiver<Notification>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        // Numeric ids and sequence numbers from an earlier connection mean nothing now
        self.identity.invalidate();
        self.state.reset_session();

        self.authenticate().await?;
        let mut auth_retry = interval_at(
            Instant::now() + self.settings.auth_timeout,
            self.settings.auth_timeout,
        );
        let mut transmit = interval(self.settings.transmit_interval);
        transmit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                packet = self.framer.read_packet(&mut self.reader) => {
                    match packet? {
                        Some(packet) => self.handle(packet).await?,
                        None => return Ok(SessionEnd::Disconnected),
                    }
                }
                Some(notification) = notifications.recv() => {
                    self.notified(notification).await?;
                }
                _ = transmit.tick() => {
                    let expired = self.state.expire_stale();
                    if expired > 0 {
                        debug!(stations = expired, "Resending unacknowledged samples");
                    }
                    self.transmit().await?;
                }
                _ = auth_retry.tick() => {
                    if !self.identity.is_valid() {
                        warn!("No station list after {:?}, authenticating again", self.settings.auth_timeout);
                        self.authenticate().await?;
                    }
                }
                _ = shutdown.changed() => {
                    self.drain().await?;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    async fn authenticate(&mut self) -> Result<()> {
        debug!("Sending authentication");
        write_packet(
            &mut self.writer,
            &TcpPacket::Authenticate {
                auth_code: self.settings.auth_code,
            },
        )
        .await?;
        Ok(())
    }

    async fn handle(&mut self, packet: TcpPacket) -> Result<()> {
        match packet {
            TcpPacket::StationInfo(info) => {
                self.identity.load(&info);
                info!(
                    stations = info.stations.len(),
                    image_types = info.image_types.len(),
                    image_sources = info.image_sources.len(),
                    "Authenticated"
                );
                self.transmit().await?;
            }
            TcpPacket::AuthenticateFailed => {
                return Err(anyhow!("server rejected authorisation code"));
            }
            TcpPacket::SampleAcknowledgement { acks } => {
                debug!(count = acks.len(), "Samples acknowledged");
                for ack in acks {
                    match self.identity.station_code(ack.station_id).cloned() {
                        Some(code) => self.state.acknowledge_sample(&code, ack.timestamp).await?,
                        None => warn!(station_id = %ack.station_id, "Acknowledgement for unknown station id"),
                    }
                }
            }
            TcpPacket::ImageAcknowledgement { acks } => {
                for ack in acks {
                    self.state.acknowledge_image(&self.identity, ack).await?;
                }
            }
            other => warn!("Ignoring unexpected {} packet", other.packet_type()),
        }
        Ok(())
    }

    async fn notified(&mut self, notification: Notification) -> Result<()> {
        if !self.identity.is_valid() {
            return Ok(());
        }
        match notification {
            Notification::Live(reading) => {
                if let Some(record) = self.state.live_record(&self.identity, reading).await? {
                    self.send_records(vec![record]).await?;
                }
                Ok(())
            }
            Notification::Sample(_) | Notification::Image => self.transmit().await,
        }
    }

    /// Send everything that is waiting
    async fn transmit(&mut self) -> Result<()> {
        if !self.identity.is_valid() {
            return Ok(());
        }

        let records = self.state.collect_samples(&self.identity).await?;
        self.send_records(records).await?;

        for image in self.state.collect_images(&self.identity).await? {
            debug!(
                source = image.image_source_id,
                timestamp = image.timestamp.as_unix(),
                "Sending image"
            );
            write_packet(&mut self.writer, &TcpPacket::Image(image)).await?;
        }
        Ok(())
    }

    async fn send_records(&mut self, records: Vec<WeatherRecord>) -> Result<()> {
        for batch in batch_weather_data(records) {
            write_packet(&mut self.writer, &TcpPacket::WeatherData { records: batch }).await?;
        }
        Ok(())
    }

    /// Handle acknowledgements already received before stopping
    async fn drain(&mut self) -> Result<()> {
        let mut handled = 0;
        while let Some(packet) = self.framer.next_packet()? {
            self.handle_ack_only(packet).await?;
            handled += 1;
        }
        info!(handled, "Session stopping");
        Ok(())
    }

    async fn handle_ack_only(&mut self, packet: TcpPacket) -> Result<()> {
        match packet {
            TcpPacket::SampleAcknowledgement { .. } | TcpPacket::ImageAcknowledgement { .. } => {
                self.handle(packet).await
            }
            _ => Ok(()),
        }
    }
}

/// Split records into WeatherData packets within the 16-bit length limit
pub fn batch_weather_data(records: Vec<WeatherRecord>) -> Vec<Vec<WeatherRecord>> {
    let empty = TcpPacket::weather_data_size(&[]);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = empty;

    for record in records {
        let frame = record_frame_size(&record);
        if !current.is_empty() && size + frame > MAX_WEATHER_DATA_SIZE {
            batches.push(std::mem::take(&mut current));
            size = empty;
        }
        size += frame;
        current.push(record);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use crate::notify;
    use crate::watcher::hint_for;
    use wxpush_protocol::{
        Code, CodeMapping, FieldList, HardwareType, SampleAck, SampleDataRecord, SequenceId,
        StationEntry, StationId, StationInfo, Timestamp,
    };
    use wxpush_replication::{ImageReplicator, ReplicationPolicy};
    use wxpush_storage::{LIVE_CHANNEL, LiveRow, MemoryStore, SampleRow, StationStore};

    fn code() -> Code {
        Code::new("rua").unwrap()
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            auth_code: 42,
            auth_timeout: Duration::from_secs(60),
            transmit_interval: Duration::from_secs(3600),
        }
    }

    fn station_info() -> TcpPacket {
        TcpPacket::StationInfo(StationInfo {
            stations: vec![StationEntry {
                code: code(),
                hardware: HardwareType::Generic,
                station_id: StationId::new(3),
            }],
            image_types: vec![CodeMapping {
                code: Code::new("CAM").unwrap(),
                id: 0,
            }],
            image_sources: Vec::new(),
        })
    }

    async fn state_with_samples(stamps: &[u32]) -> (Arc<MemoryStore>, UploadState) {
        let store = MemoryStore::new();
        for &ts in stamps {
            store.add_sample(SampleRow {
                station_code: code(),
                timestamp: Timestamp::from_unix(ts),
                download_timestamp: Timestamp::from_unix(ts),
                field_list: FieldList::from_ids([2]).unwrap(),
                field_data: Bytes::from_static(&[1]),
            });
        }
        let images = Arc::new(ImageReplicator::new(store.clone(), 1, ReplicationPolicy::default()));
        let state = UploadState::new(store.clone(), images, 100, Duration::from_secs(300))
            .await
            .unwrap();
        (store, state)
    }

    #[test]
    fn test_batches_respect_packet_limit() {
        let record = WeatherRecord::Sample(SampleDataRecord {
            station_id: StationId::new(0),
            timestamp: Timestamp::from_unix(1),
            download_timestamp: Timestamp::from_unix(1),
            field_list: FieldList::EMPTY,
            field_data: Bytes::from(vec![0u8; 1000]),
        });
        let batches = batch_weather_data(vec![record; 200]);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(TcpPacket::weather_data_size(batch) <= MAX_WEATHER_DATA_SIZE);
        }
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 200);
        assert!(batch_weather_data(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_authenticates_sends_and_records_acks() {
        let (store, mut state) = state_with_samples(&[100, 200]).await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_notify_tx, mut notifications) = mpsc::channel(4);
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let server_task = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(server);
            let mut framer = TcpFramer::new();

            let auth = framer.read_packet(&mut read).await.unwrap().unwrap();
            assert_eq!(auth, TcpPacket::Authenticate { auth_code: 42 });
            write_packet(&mut write, &station_info()).await.unwrap();

            let data = framer.read_packet(&mut read).await.unwrap().unwrap();
            let TcpPacket::WeatherData { records } = data else {
                panic!("unexpected {data:?}");
            };
            assert_eq!(records.len(), 2);
            assert!(records.iter().all(|r| r.station_id() == StationId::new(3)));

            let acks = records
                .iter()
                .map(|r| match r {
                    WeatherRecord::Sample(s) => SampleAck {
                        timestamp: s.timestamp,
                        station_id: s.station_id,
                    },
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            write_packet(&mut write, &TcpPacket::SampleAcknowledgement { acks })
                .await
                .unwrap();
            // Keep the stream open until the client has seen the acks
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown_tx.send(true).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let end = TcpSession::new(client, &mut state, settings())
            .run(&mut notifications, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
        server_task.await.unwrap();

        assert_eq!(
            store.load_watermark(1, &code()).await.unwrap(),
            Some(Timestamp::from_unix(200))
        );
    }

    #[tokio::test]
    async fn test_live_notification_sent_on_the_wire() {
        let (store, mut state) = state_with_samples(&[]).await;
        store.add_live(LiveRow {
            station_code: code(),
            sequence_id: SequenceId::new(9),
            field_list: FieldList::from_ids([2, 5]).unwrap(),
            field_data: Bytes::from_static(&[40, 71]),
            received_at: Timestamp::from_unix(100),
        });
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (notifier, mut notifications) = notify::channel(4);
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let server_task = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(server);
            let mut framer = TcpFramer::new();
            framer.read_packet(&mut read).await.unwrap().unwrap();
            write_packet(&mut write, &station_info()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            // The logger rewrote the live row and the database said so
            let hint = hint_for(store.as_ref(), LIVE_CHANNEL, "rua")
                .await
                .unwrap()
                .unwrap();
            assert!(notifier.try_notify(hint));

            let data = framer.read_packet(&mut read).await.unwrap().unwrap();
            let TcpPacket::WeatherData { records } = data else {
                panic!("unexpected {data:?}");
            };
            match records.as_slice() {
                [WeatherRecord::Live(live)] => {
                    assert_eq!(live.station_id, StationId::new(3));
                    assert_eq!(live.sequence_id, SequenceId::new(0));
                    assert_eq!(live.field_list, FieldList::from_ids([2, 5]).unwrap());
                    assert_eq!(live.field_data, Bytes::from_static(&[40, 71]));
                }
                other => panic!("expected one live record, got {other:?}"),
            }
            shutdown_tx.send(true).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let end = TcpSession::new(client, &mut state, settings())
            .run(&mut notifications, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_auth_is_an_error() {
        let (_, mut state) = state_with_samples(&[]).await;
        let (client, server) = tokio::io::duplex(1024);
        let (_notify_tx, mut notifications) = mpsc::channel(4);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(server);
            TcpFramer::new().read_packet(&mut read).await.unwrap();
            write_packet(&mut write, &TcpPacket::AuthenticateFailed).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let result = TcpSession::new(client, &mut state, settings())
            .run(&mut notifications, &mut shutdown)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_server_close_is_disconnect() {
        let (_, mut state) = state_with_samples(&[]).await;
        let (client, server) = tokio::io::duplex(1024);
        let (_notify_tx, mut notifications) = mpsc::channel(4);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        drop(server);

        // Writing the auth packet may fail or the read may see EOF first
        let result = TcpSession::new(client, &mut state, settings())
            .run(&mut notifications, &mut shutdown)
            .await;
        assert!(matches!(result, Ok(SessionEnd::Disconnected) | Err(_)));
    }
}
