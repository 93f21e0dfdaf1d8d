//! Station to archive replication over TCP

mod integration_harness;

use bytes::Bytes;
use integration_harness::{AUTH_CODE, client_config, spawn_server, start_client, wait_until};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use wxpush_client::notify::{LiveReading, Notification};
use wxpush_protocol::{
    Code, DeltaEncoding, FieldList, RecordKind, SampleAck, SampleDataRecord, StationId,
    TcpPacket, Timestamp, WeatherRecord,
};
use wxpush_storage::{ImageRow, MemoryStore, ReplicationState, SampleRow, StationStore};
use wxpush_transport::{TcpFramer, write_packet};

const TIMEOUT: Duration = Duration::from_secs(10);

fn rua() -> Code {
    Code::new("rua").unwrap()
}

fn sample(ts: u32) -> SampleRow {
    SampleRow {
        station_code: rua(),
        timestamp: Timestamp::from_unix(ts),
        download_timestamp: Timestamp::from_unix(ts + 5),
        // u8 + i16 + u8
        field_list: FieldList::from_ids([2, 3, 5]).unwrap(),
        field_data: Bytes::from_static(&[60, 0, 215, 80]),
    }
}

#[tokio::test]
async fn test_samples_archived_and_not_resent() {
    let server = spawn_server().await;
    let server = &server;
    let station = &MemoryStore::new();
    for ts in [1_700_000_000, 1_700_000_300, 1_700_000_600] {
        station.add_sample(sample(ts));
    }

    let client = start_client(client_config("tcp", server.tcp_addr, AUTH_CODE), station.clone());
    assert!(
        wait_until(TIMEOUT, move || async move { server.store.samples(&rua()).len() == 3 }).await,
        "samples were not archived"
    );
    assert!(
        wait_until(TIMEOUT, move || async move {
            station.load_watermark(1, &rua()).await.unwrap() == Some(Timestamp::from_unix(1_700_000_600))
        })
        .await,
        "watermark did not advance"
    );

    let archived = &server.store.samples(&rua())[0];
    assert_eq!(archived.field_data, sample(1_700_000_000).field_data);
    assert_eq!(archived.download_timestamp, Timestamp::from_unix(1_700_000_005));
    client.stop().await.unwrap();

    // A restarted uploader resumes after the watermark and sends nothing
    assert!(wait_until(TIMEOUT, move || async move { server.metrics.active_sessions.get() == 0 }).await);
    let before = server.metrics.packets_received.get();
    let client = start_client(client_config("tcp", server.tcp_addr, AUTH_CODE), station.clone());
    assert!(wait_until(TIMEOUT, move || async move { server.metrics.active_sessions.get() == 1 }).await);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Only the authentication packet
    assert_eq!(server.metrics.packets_received.get() - before, 1);
    assert_eq!(server.metrics.samples_stored.get(), 3);

    // New data still flows on the same connection
    station.add_sample(sample(1_700_000_900));
    assert!(wait_until(TIMEOUT, move || async move { server.store.samples(&rua()).len() == 4 }).await);
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_reply_until_frame_complete() {
    let server = spawn_server().await;
    let stream = TcpStream::connect(server.tcp_addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    let mut framer = TcpFramer::new();

    write_packet(&mut write, &TcpPacket::Authenticate { auth_code: AUTH_CODE })
        .await
        .unwrap();
    let Some(TcpPacket::StationInfo(info)) = framer.read_packet(&mut read).await.unwrap() else {
        panic!("expected station info");
    };
    let station_id = info
        .stations
        .iter()
        .find(|s| s.code == rua())
        .map(|s| s.station_id)
        .unwrap();
    assert_eq!(station_id, StationId::new(3));

    let t = Timestamp::from_unix(1_442_136_671);
    let sample = sample(t.as_unix());
    let packet = TcpPacket::WeatherData {
        records: vec![WeatherRecord::Sample(SampleDataRecord {
            station_id,
            timestamp: t,
            download_timestamp: sample.download_timestamp,
            field_list: sample.field_list,
            field_data: sample.field_data,
        })],
    };
    let encoded = packet.encode().unwrap();
    let (head, last) = encoded.split_at(encoded.len() - 1);

    write.write_all(head).await.unwrap();
    let early = tokio::time::timeout(Duration::from_millis(300), framer.read_packet(&mut read)).await;
    assert!(early.is_err(), "server replied before the frame was complete");
    assert!(server.store.samples(&rua()).is_empty());

    write.write_all(last).await.unwrap();
    let reply = framer.read_packet(&mut read).await.unwrap();
    assert_eq!(
        reply,
        Some(TcpPacket::SampleAcknowledgement {
            acks: vec![SampleAck {
                timestamp: t,
                station_id,
            }],
        })
    );
    assert_eq!(server.store.samples(&rua()).len(), 1);
}

#[tokio::test]
async fn test_bad_auth_code_rejected() {
    let server = spawn_server().await;
    let server = &server;

    let stream = TcpStream::connect(server.tcp_addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();
    write_packet(&mut write, &TcpPacket::Authenticate { auth_code: 99 })
        .await
        .unwrap();
    let reply = TcpFramer::new().read_packet(&mut read).await.unwrap();
    assert_eq!(reply, Some(TcpPacket::AuthenticateFailed));
    assert_eq!(server.metrics.auth_failures.get(), 1);

    // An uploader with the wrong code keeps retrying and archives nothing
    let station = &MemoryStore::new();
    station.add_sample(sample(1_700_000_000));
    let client = start_client(client_config("tcp", server.tcp_addr, 99), station.clone());
    assert!(wait_until(TIMEOUT, move || async move { server.metrics.auth_failures.get() >= 2 }).await);
    assert!(server.store.samples(&rua()).is_empty());
    assert_eq!(station.load_watermark(1, &rua()).await.unwrap(), None);
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_image_replicated_and_confirmed() {
    let server = spawn_server().await;
    let server = &server;
    let station = &MemoryStore::new();
    let image_id = station
        .insert_image(
            &ImageRow {
                id: 0,
                source_code: Code::new("cam1").unwrap(),
                type_code: Code::new("CAM").unwrap(),
                timestamp: Timestamp::from_unix(1_700_000_000),
                title: "Sky".into(),
                description: "Looking north".into(),
                mime_type: "image/jpeg".into(),
                metadata: String::new(),
                data: Bytes::from_static(b"\xff\xd8\xff\xe0jpeg"),
            },
            &[1],
        )
        .await
        .unwrap();

    let client = start_client(client_config("tcp", server.tcp_addr, AUTH_CODE), station.clone());
    assert!(
        wait_until(TIMEOUT, move || async move {
            station
                .replication_status(1, image_id)
                .is_some_and(|s| s.status == ReplicationState::Done)
        })
        .await,
        "image was not confirmed"
    );

    let images = server.store.images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].title, "Sky");
    assert_eq!(images[0].source_code, Code::new("cam1").unwrap());
    assert_eq!(&images[0].data[..], b"\xff\xd8\xff\xe0jpeg");
    client.stop().await.unwrap();
}

/// indoor_humidity, indoor_temperature, temperature, pressure
fn reading(indoor_humidity: u8) -> Notification {
    Notification::Live(LiveReading {
        station: rua(),
        field_list: FieldList::from_ids([2, 3, 4, 6]).unwrap(),
        field_data: Bytes::copy_from_slice(&[indoor_humidity, 0, 200, 0, 215, 39, 146]),
    })
}

#[tokio::test]
async fn test_live_readings_forwarded_and_patched() {
    let server = spawn_server().await;
    let server = &server;
    let station = MemoryStore::new();
    let client = start_client(client_config("tcp", server.tcp_addr, AUTH_CODE), station);
    let notifier = &client.notifier;

    // Readings before the session is up are dropped, so keep offering
    assert!(
        wait_until(TIMEOUT, move || async move {
            notifier.try_notify(reading(40));
            server.store.live(&rua()).is_some()
        })
        .await,
        "live reading was not archived"
    );
    let first = server.store.live(&rua()).unwrap();
    assert_eq!(first.field_data, Bytes::from_static(&[40, 0, 200, 0, 215, 39, 146]));

    // Only indoor humidity changed: sent as a diff, archived in full
    assert!(
        wait_until(TIMEOUT, move || async move {
            notifier.try_notify(reading(41));
            server
                .store
                .live(&rua())
                .is_some_and(|live| live.field_data[0] == 41)
        })
        .await,
        "changed reading was not archived"
    );
    let second = server.store.live(&rua()).unwrap();
    assert_eq!(second.sequence_id, first.sequence_id.next());
    assert_eq!(second.field_list, FieldList::from_ids([2, 3, 4, 6]).unwrap());
    assert_eq!(second.field_data, Bytes::from_static(&[41, 0, 200, 0, 215, 39, 146]));
    assert_eq!(
        server
            .metrics
            .records_received_count(RecordKind::Live, DeltaEncoding::LiveDiff),
        1
    );
    assert_eq!(server.metrics.undecodable_live_records.get(), 0);
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = spawn_server().await;
    let server = &server;
    let station = &MemoryStore::new();
    station.add_sample(sample(1_700_000_000));
    let client = start_client(client_config("tcp", server.tcp_addr, AUTH_CODE), station.clone());
    assert!(wait_until(TIMEOUT, move || async move { server.store.samples(&rua()).len() == 1 }).await);

    server.shutdown();
    assert!(
        wait_until(TIMEOUT, move || async move { server.is_stopped() }).await,
        "server did not stop"
    );
    assert_eq!(server.metrics.active_sessions.get(), 0);
    client.stop().await.unwrap();
}
