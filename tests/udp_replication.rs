//! Station to archive replication over UDP

mod integration_harness;

use bytes::Bytes;
use integration_harness::{AUTH_CODE, client_config, spawn_server, start_client, wait_until};
use std::time::Duration;
use wxpush_client::notify::{LiveReading, Notification};
use wxpush_protocol::{Code, FieldList, Timestamp};
use wxpush_storage::{MemoryStore, SampleRow, StationStore};

const TIMEOUT: Duration = Duration::from_secs(10);

fn rua() -> Code {
    Code::new("rua").unwrap()
}

#[tokio::test]
async fn test_samples_and_live_over_udp() {
    let server = spawn_server().await;
    let server = &server;
    let station = &MemoryStore::new();
    for ts in [1_700_000_000u32, 1_700_000_300] {
        station.add_sample(SampleRow {
            station_code: rua(),
            timestamp: Timestamp::from_unix(ts),
            download_timestamp: Timestamp::from_unix(ts),
            field_list: FieldList::from_ids([4]).unwrap(),
            field_data: Bytes::from_static(&[0, 200]),
        });
    }

    let client = start_client(client_config("udp", server.udp_addr, AUTH_CODE), station.clone());
    assert!(
        wait_until(TIMEOUT, move || async move { server.store.samples(&rua()).len() == 2 }).await,
        "samples were not archived"
    );
    assert!(
        wait_until(TIMEOUT, move || async move {
            station.load_watermark(1, &rua()).await.unwrap() == Some(Timestamp::from_unix(1_700_000_300))
        })
        .await,
        "acknowledgements did not arrive"
    );
    assert_eq!(server.metrics.udp_peers.get(), 1);

    let reading = LiveReading {
        station: rua(),
        field_list: FieldList::from_ids([2]).unwrap(),
        field_data: Bytes::from_static(&[55]),
    };
    assert!(client.notifier.notify(Notification::Live(reading)).await);
    assert!(
        wait_until(TIMEOUT, move || async move { server.store.live(&rua()).is_some() }).await,
        "live record was not stored"
    );
    let live = server.store.live(&rua()).unwrap();
    assert_eq!(live.sequence_id.get(), 0);
    assert_eq!(&live.field_data[..], &[55]);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_auth_code_ignored() {
    let server = spawn_server().await;
    let server = &server;
    let station = &MemoryStore::new();
    station.add_sample(SampleRow {
        station_code: rua(),
        timestamp: Timestamp::from_unix(1_700_000_000),
        download_timestamp: Timestamp::from_unix(1_700_000_000),
        field_list: FieldList::from_ids([2]).unwrap(),
        field_data: Bytes::from_static(&[1]),
    });

    let client = start_client(client_config("udp", server.udp_addr, 7), station.clone());
    assert!(wait_until(TIMEOUT, move || async move { server.metrics.auth_failures.get() >= 1 }).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.store.samples(&rua()).is_empty());
    assert_eq!(server.metrics.udp_peers.get(), 0);
    client.stop().await.unwrap();
}
