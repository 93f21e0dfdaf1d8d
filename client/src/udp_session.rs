//! Uploading over UDP
//!
//! There is no connection, so the session lasts until shutdown. The station
//! table is requested until the server answers, and unacknowledged samples
//! are sent again once they go stale.

use crate::notify::Notification;
use crate::state::UploadState;
use crate::tcp_session::{SessionEnd, SessionSettings};
use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};
use wxpush_protocol::{UdpPacket, WeatherRecord};
use wxpush_replication::IdentityTable;
use wxpush_transport::UdpFramer;

const RECEIVE_BUFFER: usize = 64 * 1024;

pub struct UdpSession<'a> {
    socket: UdpSocket,
    framer: UdpFramer,
    identity: IdentityTable,
    state: &'a mut UploadState,
    settings: SessionSettings,
}

impl<'a> UdpSession<'a> {
    /// `socket` must already be connected to the server
    pub fn new(socket: UdpSocket, mtu: usize, state: &'a mut UploadState, settings: SessionSettings) -> Self {
        Self {
            socket,
            framer: UdpFramer::new(settings.auth_code, mtu),
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
        self.request_stations().await?;

        let mut station_retry = interval_at(
            Instant::now() + self.settings.auth_timeout,
            self.settings.auth_timeout,
        );
        let mut transmit = interval(self.settings.transmit_interval);
        transmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECEIVE_BUFFER];

        loop {
            tokio::select! {
                received = self.socket.recv(&mut buf) => {
                    let len = received?;
                    match UdpFramer::decode(&buf[..len]) {
                        Ok(packet) => self.handle(packet).await?,
                        Err(e) => warn!("Discarding malformed datagram: {}", e),
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
                _ = station_retry.tick() => {
                    if !self.identity.is_valid() {
                        warn!("No station list after {:?}, asking again", self.settings.auth_timeout);
                        self.request_stations().await?;
                    }
                }
                _ = shutdown.changed() => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    async fn request_stations(&mut self) -> Result<()> {
        // A new request starts a new session on the server
        self.identity.invalidate();
        self.framer.reset();
        self.state.reset_session();
        let datagram = self.framer.station_info_request()?;
        self.send(datagram).await
    }

    async fn handle(&mut self, packet: UdpPacket) -> Result<()> {
        match packet {
            UdpPacket::StationInfoResponse { stations, .. } => {
                self.identity.load_stations(&stations);
                info!(stations = stations.len(), "Received station list");
                self.transmit().await?;
            }
            UdpPacket::SampleAcknowledgement {
                lost_live_records,
                acks,
                ..
            } => {
                if lost_live_records.get() > 0 {
                    debug!(lost = lost_live_records.get(), "Server reports lost live records");
                }
                for ack in acks {
                    match self.identity.station_code(ack.station_id).cloned() {
                        Some(code) => self.state.acknowledge_sample(&code, ack.timestamp).await?,
                        None => warn!(station_id = %ack.station_id, "Acknowledgement for unknown station id"),
                    }
                }
            }
            other => warn!("Ignoring unexpected {} datagram", other.packet_type()),
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
            Notification::Sample(_) => self.transmit().await,
            // Images only travel over the stream transports
            Notification::Image => Ok(()),
        }
    }

    async fn transmit(&mut self) -> Result<()> {
        if !self.identity.is_valid() {
            return Ok(());
        }
        let records = self.state.collect_samples(&self.identity).await?;
        self.send_records(records).await
    }

    async fn send_records(&mut self, records: Vec<WeatherRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for datagram in self.framer.weather_data(records)? {
            self.send(datagram).await?;
        }
        Ok(())
    }

    async fn send(&self, datagram: Bytes) -> Result<()> {
        self.socket.send(&datagram).await?;
        Ok(())
    }
}
