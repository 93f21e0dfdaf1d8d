//! In-process archive server and uploader for end-to-end tests

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use wxpush_client::config::ClientConfig;
use wxpush_client::notify::{self, Notifier};
use wxpush_client::uploader;
use wxpush_daemon::Daemon;
use wxpush_daemon::config::DaemonConfig;
use wxpush_daemon::metrics::Metrics;
use wxpush_storage::MemoryStore;

pub const AUTH_CODE: u64 = 42;

const SERVER_CONFIG: &str = r#"
[server]
tcp_bind = "127.0.0.1:0"
udp_bind = "127.0.0.1:0"

[[sites]]
auth_code = 42
stations = [
    { code = "aaa" },
    { code = "bbb" },
    { code = "ccc" },
    { code = "rua" },
]
image_types = ["CAM"]
image_sources = [{ code = "cam1", station = "rua" }]

[monitoring]
prometheus_enabled = false
"#;

/// Archive server on ephemeral loopback ports
pub struct TestServer {
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<Metrics>,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Ask the server to stop accepting and drain its connections
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server() -> TestServer {
    let config = DaemonConfig::parse(SERVER_CONFIG).expect("server config");
    let store = MemoryStore::new();
    for site in &config.sites {
        site.register(store.as_ref()).await.expect("register site");
    }
    let metrics = Metrics::new().expect("metrics");
    let daemon = Daemon::bind(&config, store.clone(), metrics.clone())
        .await
        .expect("bind daemon");
    let tcp_addr = daemon.tcp_addr().expect("tcp listener");
    let udp_addr = daemon.udp_addr().expect("udp socket");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let _ = daemon.run(shutdown_rx).await;
    });

    TestServer {
        store,
        metrics,
        tcp_addr,
        udp_addr,
        shutdown,
        handle,
    }
}

/// Uploader settings pointing at `addr`, with short timers
pub fn client_config(transport: &str, addr: SocketAddr, auth_code: u64) -> ClientConfig {
    ClientConfig::parse(&format!(
        r#"
[connection]
transport = "{}"
host = "{}"
port = {}
auth_code = {}
reconnect_backoff_secs = 1

[replication]
transmit_interval_secs = 1
sweep_interval_secs = 1
"#,
        transport,
        addr.ip(),
        addr.port(),
        auth_code
    ))
    .expect("client config")
}

/// Uploader running on a background task
pub struct RunningClient {
    pub notifier: Notifier,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningClient {
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.handle.await?
    }
}

pub fn start_client(config: ClientConfig, store: Arc<MemoryStore>) -> RunningClient {
    let (notifier, notifications): (Notifier, mpsc::Receiver<_>) =
        notify::channel(notify::DEFAULT_CAPACITY);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle =
        tokio::spawn(async move { uploader::run(&config, store, notifications, shutdown_rx).await });
    RunningClient {
        notifier,
        shutdown,
        handle,
    }
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}
