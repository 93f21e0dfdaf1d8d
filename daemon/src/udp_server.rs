//! UDP listener
//!
//! Every datagram carries the authorisation code. Datagrams with an unknown
//! code are dropped without reply so an unauthorised sender learns nothing.

use crate::peer_registry::{PeerKey, PeerRegistry, UdpPeer};
use crate::session::{ServerContext, SessionError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use wxpush_protocol::{StationEntry, UDP_HEADER_SIZE, UdpHeader, UdpPacket};
use wxpush_transport::UdpFramer;

/// Largest datagram accepted
const RECV_BUFFER: usize = 65536;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    ctx: Arc<ServerContext>,
    peers: Arc<PeerRegistry>,
}

impl UdpServer {
    pub fn new(socket: UdpSocket, ctx: Arc<ServerContext>, peers: Arc<PeerRegistry>) -> Self {
        Self {
            socket: Arc::new(socket),
            ctx,
            peers,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and handle datagrams until shutdown or until the socket fails.
    /// A datagram being handled when shutdown arrives is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        info!("UDP server listening on {}", self.socket.local_addr()?);

        let mut buf = vec![0u8; RECV_BUFFER];
        let mut eviction = tokio::time::interval(EVICTION_INTERVAL);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = received?;
                    if let Err(e) = self.handle_datagram(&buf[..len], addr).await {
                        error!(peer = %addr, "Failed to handle datagram: {}", e);
                    }
                }
                _ = eviction.tick() => {
                    self.peers.evict_idle(Instant::now());
                    self.ctx.metrics.udp_peers.set(self.peers.count() as i64);
                }
                _ = shutdown.changed() => {
                    info!("UDP server stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), SessionError> {
        let packet = match UdpFramer::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.ctx.metrics.malformed_packets.inc();
                warn!(peer = %addr, len = datagram.len(), "Dropping malformed datagram: {}", e);
                return Ok(());
            }
        };
        self.ctx.metrics.packets_received.inc();

        let auth_code = packet.header().auth_code;
        if !self.ctx.store.authorise(auth_code).await? {
            self.ctx.metrics.auth_failures.inc();
            debug!(peer = %addr, "Ignoring datagram with unknown authorisation code");
            return Ok(());
        }

        let (state, created) = self.peers.touch(PeerKey { addr, auth_code }, Instant::now());
        let mut peer = state.lock().await;
        if created {
            // Clients may send data before asking for the station list
            peer.identity = self.ctx.authenticate(auth_code).await?;
            self.ctx.metrics.udp_peers.set(self.peers.count() as i64);
        }

        trace!(peer = %addr, sequence = packet.header().sequence, "{}", packet.packet_type());
        let replies = match packet {
            UdpPacket::StationInfoRequest { .. } => {
                self.station_info(&mut peer, auth_code).await?
            }
            UdpPacket::WeatherData { records, .. } => {
                let UdpPeer {
                    identity,
                    decoder,
                    framer,
                } = &mut *peer;
                let Some(identity) = identity else {
                    return Ok(());
                };
                let acks = self.ctx.ingest_records(identity, decoder, records).await?;
                if acks.is_empty() {
                    Vec::new()
                } else {
                    let lost_live_records = decoder.lost_live();
                    let per_datagram = framer.acks_per_datagram().max(1);
                    acks.chunks(per_datagram)
                        .map(|chunk| UdpPacket::SampleAcknowledgement {
                            header: UdpHeader::default(),
                            lost_live_records,
                            acks: chunk.to_vec(),
                        })
                        .collect()
                }
            }
            other => {
                warn!(
                    peer = %addr,
                    "Ignoring {} datagram, only sent by servers",
                    other.packet_type()
                );
                Vec::new()
            }
        };

        for reply in replies {
            let packet_type = reply.packet_type();
            match peer.framer.encode(reply) {
                Ok(bytes) => {
                    self.ctx.metrics.packet_sent(packet_type, bytes.len());
                    self.send(bytes, addr).await;
                }
                Err(e) => error!(peer = %addr, "Failed to encode reply: {}", e),
            }
        }
        Ok(())
    }

    async fn station_info(
        &self,
        peer: &mut UdpPeer,
        auth_code: u64,
    ) -> Result<Vec<UdpPacket>, SessionError> {
        // The client has probably restarted: sequence numbers begin again
        peer.decoder.reset();
        peer.framer.reset();
        peer.identity = self.ctx.authenticate(auth_code).await?;

        let mut stations: Vec<StationEntry> = peer
            .identity
            .as_ref()
            .map(|identity| identity.stations().to_vec())
            .unwrap_or_default();
        let capacity = peer.framer.mtu().saturating_sub(UDP_HEADER_SIZE + 1) / StationEntry::SIZE;
        if stations.len() > capacity {
            warn!(
                "{} stations do not fit one datagram, sending the first {}",
                stations.len(),
                capacity
            );
            stations.truncate(capacity);
        }

        debug!(stations = stations.len(), "Sending station info");
        Ok(vec![UdpPacket::StationInfoResponse {
            header: UdpHeader::default(),
            stations,
        }])
    }

    async fn send(&self, bytes: Bytes, addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!(peer = %addr, "Failed to send datagram: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use wxpush_protocol::{
        Code, FieldList, HardwareType, LiveDataRecord, PacketType, SampleDataRecord, SequenceId,
        Timestamp, WeatherRecord,
    };
    use wxpush_storage::{MemoryStore, RegistryStore, StationRecord};

    async fn start() -> (Arc<MemoryStore>, Arc<ServerContext>, SocketAddr) {
        let store = MemoryStore::new();
        let code = Code::new("rua").unwrap();
        store
            .register_station(&StationRecord {
                code: code.clone(),
                hardware: HardwareType::Generic,
            })
            .await
            .unwrap();
        store.grant_access(42, &code).await.unwrap();

        let ctx = ServerContext::new(store.clone(), Metrics::new().unwrap());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpServer::new(
            socket,
            ctx.clone(),
            PeerRegistry::new(Duration::from_secs(60), 1400),
        );
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown) = watch::channel(false);
        tokio::spawn(async move {
            let _shutdown_tx = shutdown_tx;
            server.run(shutdown).await
        });
        (store, ctx, addr)
    }

    async fn exchange(client: &UdpSocket, datagram: &[u8]) -> Option<UdpPacket> {
        client.send(datagram).await.unwrap();
        let mut buf = [0u8; 2048];
        match tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await {
            Ok(Ok(n)) => Some(UdpFramer::decode(&buf[..n]).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_station_info_then_samples() {
        let (store, ctx, addr) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        let mut framer = UdpFramer::new(42, 1400);

        let reply = exchange(&client, &framer.station_info_request().unwrap()).await;
        let Some(UdpPacket::StationInfoResponse { stations, header }) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(header.auth_code, 42);
        assert_eq!(stations[0].code.as_str(), "rua");
        let station_id = stations[0].station_id;

        let records = vec![
            WeatherRecord::Live(LiveDataRecord {
                station_id,
                sequence_id: SequenceId::new(0),
                field_list: FieldList::from_ids([2]).unwrap(),
                field_data: Bytes::from_static(&[50]),
            }),
            WeatherRecord::Sample(SampleDataRecord {
                station_id,
                timestamp: Timestamp::from_unix(600),
                download_timestamp: Timestamp::from_unix(601),
                field_list: FieldList::from_ids([2]).unwrap(),
                field_data: Bytes::from_static(&[51]),
            }),
        ];
        let datagrams = framer.weather_data(records).unwrap();
        assert_eq!(datagrams.len(), 1);

        let reply = exchange(&client, &datagrams[0]).await;
        let Some(UdpPacket::SampleAcknowledgement {
            acks,
            lost_live_records,
            ..
        }) = reply
        else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].timestamp, Timestamp::from_unix(600));
        assert_eq!(acks[0].station_id, station_id);
        assert_eq!(lost_live_records.get(), 0);
        assert_eq!(store.samples(&Code::new("rua").unwrap()).len(), 1);

        let metrics = &ctx.metrics;
        assert_eq!(metrics.packets_sent_count(PacketType::StationInfoResponse), 1);
        assert_eq!(metrics.packets_sent_count(PacketType::UdpSampleAcknowledgement), 1);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let store = MemoryStore::new();
        let ctx = ServerContext::new(store, Metrics::new().unwrap());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpServer::new(socket, ctx, PeerRegistry::new(Duration::from_secs(60), 1400));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.run(shutdown));

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bad_auth_silently_dropped() {
        let (_, _, addr) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        let mut framer = UdpFramer::new(7, 1400);

        assert!(exchange(&client, &framer.station_info_request().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_ignored() {
        let (_, _, addr) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        assert!(exchange(&client, &[0xEE, 0, 1, 2]).await.is_none());

        // Server still answers afterwards
        let mut framer = UdpFramer::new(42, 1400);
        assert!(exchange(&client, &framer.station_info_request().unwrap()).await.is_some());
    }
}
