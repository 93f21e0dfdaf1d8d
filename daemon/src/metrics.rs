//! Prometheus metrics

use crate::config::MonitoringConfig;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};
use wxpush_protocol::{DeltaEncoding, PacketType, RecordKind};

pub struct Metrics {
    registry: Registry,

    // Counters
    pub packets_received: IntCounter,
    pub malformed_packets: IntCounter,
    pub auth_failures: IntCounter,
    pub samples_stored: IntCounter,
    pub live_records: IntCounter,
    pub images_stored: IntCounter,
    pub duplicate_samples: IntCounter,
    pub duplicate_images: IntCounter,
    pub undecodable_live_records: IntCounter,
    pub undecodable_sample_records: IntCounter,

    /// Records received, by kind and delta encoding
    pub records_received: IntCounterVec,
    /// Packets sent, by packet type
    pub packets_sent: IntCounterVec,

    // Histograms
    pub record_size_ratio: HistogramVec,
    pub sent_packet_bytes: HistogramVec,

    // Gauges
    pub active_sessions: IntGauge,
    pub udp_peers: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Arc<Self>> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let packets_received = counter(
            "wxpush_packets_received_total",
            "Packets decoded from TCP streams and UDP datagrams",
        )?;
        let malformed_packets = counter(
            "wxpush_malformed_packets_total",
            "Packets dropped because they failed to decode",
        )?;
        let auth_failures = counter(
            "wxpush_auth_failures_total",
            "Rejected authorisation codes",
        )?;
        let samples_stored = counter("wxpush_samples_stored_total", "New samples archived")?;
        let live_records = counter("wxpush_live_records_total", "Live records accepted")?;
        let images_stored = counter("wxpush_images_stored_total", "New images archived")?;
        let duplicate_samples = counter(
            "wxpush_duplicate_samples_total",
            "Received samples that were already archived",
        )?;
        let duplicate_images = counter(
            "wxpush_duplicate_images_total",
            "Received images that were already archived",
        )?;
        let undecodable_live_records = counter(
            "wxpush_undecodable_live_records_total",
            "Delta-encoded live records whose base was unknown",
        )?;
        let undecodable_sample_records = counter(
            "wxpush_undecodable_sample_records_total",
            "Delta-encoded samples whose base was unknown",
        )?;

        let records_received = IntCounterVec::new(
            Opts::new("wxpush_records_received_total", "Weather records received"),
            &["kind", "encoding"],
        )?;
        registry.register(Box::new(records_received.clone()))?;
        let packets_sent = IntCounterVec::new(
            Opts::new("wxpush_packets_sent_total", "Packets sent to clients"),
            &["packet_type"],
        )?;
        registry.register(Box::new(packets_sent.clone()))?;

        let record_size_ratio = HistogramVec::new(
            HistogramOpts::new(
                "wxpush_record_size_ratio",
                "Received field data size over its size without delta encoding",
            )
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
            &["kind"],
        )?;
        registry.register(Box::new(record_size_ratio.clone()))?;
        let sent_packet_bytes = HistogramVec::new(
            HistogramOpts::new("wxpush_sent_packet_bytes", "Size of packets sent to clients")
                .buckets(vec![16.0, 64.0, 256.0, 512.0, 1024.0, 4096.0, 16384.0, 65536.0]),
            &["packet_type"],
        )?;
        registry.register(Box::new(sent_packet_bytes.clone()))?;

        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let active_sessions = gauge("wxpush_active_sessions", "Open TCP sessions")?;
        let udp_peers = gauge("wxpush_udp_peers", "Tracked UDP peers")?;

        Ok(Arc::new(Self {
            registry,
            packets_received,
            malformed_packets,
            auth_failures,
            samples_stored,
            live_records,
            images_stored,
            duplicate_samples,
            duplicate_images,
            undecodable_live_records,
            undecodable_sample_records,
            records_received,
            packets_sent,
            record_size_ratio,
            sent_packet_bytes,
            active_sessions,
            udp_peers,
        }))
    }

    /// Count a decoded record and how well its encoding compressed it
    pub fn record_received(
        &self,
        kind: RecordKind,
        encoding: DeltaEncoding,
        received_size: usize,
        full_size: usize,
    ) {
        let kind = kind_label(kind);
        self.records_received
            .with_label_values(&[kind, encoding.as_str()])
            .inc();
        if full_size > 0 {
            self.record_size_ratio
                .with_label_values(&[kind])
                .observe(received_size as f64 / full_size as f64);
        }
    }

    pub fn packet_sent(&self, packet_type: PacketType, size: usize) {
        self.packets_sent
            .with_label_values(&[packet_type.name()])
            .inc();
        self.sent_packet_bytes
            .with_label_values(&[packet_type.name()])
            .observe(size as f64);
    }

    pub fn records_received_count(&self, kind: RecordKind, encoding: DeltaEncoding) -> u64 {
        self.records_received
            .with_label_values(&[kind_label(kind), encoding.as_str()])
            .get()
    }

    pub fn packets_sent_count(&self, packet_type: PacketType) -> u64 {
        self.packets_sent
            .with_label_values(&[packet_type.name()])
            .get()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

fn kind_label(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Live => "live",
        RecordKind::Sample => "sample",
    }
}

fn metrics_response(metrics: &Metrics) -> Response<Full<Bytes>> {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            let mut response = Response::new(Full::new(Bytes::from_static(b"encode error")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig, metrics: Arc<Metrics>) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        let listener = match TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |_req| {
                    let response = metrics_response(&metrics);
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.samples_stored.inc_by(3);
        metrics.active_sessions.inc();

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains("wxpush_samples_stored_total 3"));
        assert!(text.contains("wxpush_active_sessions 1"));
    }

    #[test]
    fn test_labelled_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.packet_sent(PacketType::SampleAcknowledgement, 12);
        metrics.packet_sent(PacketType::SampleAcknowledgement, 20);
        assert_eq!(metrics.packets_sent_count(PacketType::SampleAcknowledgement), 2);
        assert_eq!(metrics.packets_sent_count(PacketType::StationInfo), 0);

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains(r#"wxpush_packets_sent_total{packet_type="SampleAcknowledgement"} 2"#));
        assert!(text.contains(r#"wxpush_sent_packet_bytes_sum{packet_type="SampleAcknowledgement"} 32"#));

        metrics.record_received(RecordKind::Live, DeltaEncoding::LiveDiff, 3, 12);
        assert_eq!(metrics.records_received_count(RecordKind::Live, DeltaEncoding::LiveDiff), 1);
        assert_eq!(metrics.records_received_count(RecordKind::Sample, DeltaEncoding::LiveDiff), 0);
        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains(r#"wxpush_record_size_ratio_sum{kind="live"} 0.25"#));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.auth_failures.inc();
        assert_eq!(b.auth_failures.get(), 0);
    }
}
