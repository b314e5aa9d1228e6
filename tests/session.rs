use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use traffic_sentinel::registry::{
    CLASSIFIED_PACKETS, NETWORK_BYTES_SENT, NETWORK_CONNECTIONS, NETWORK_LATENCY, OVERSIZED_PACKETS, RATE_SPIKE,
};
use traffic_sentinel::capture::{ConnectionSource, CounterSource, NetCounters, PacketRecord, ReplaySource};
use traffic_sentinel::config::Config;
use traffic_sentinel::metrics::{LatencyProbe, ProbeResult, SnapshotRecorder};
use traffic_sentinel::monitor::{run_session, shutdown_channel, SessionParts};

/// Grows by a fixed number of bytes on every read. Clones count on their own.
struct SteadyCounters {
    bytes: AtomicU64,
    step: u64,
}

impl SteadyCounters {
    fn new(step: u64) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            step,
        }
    }
}

impl Clone for SteadyCounters {
    fn clone(&self) -> Self {
        Self {
            bytes: AtomicU64::new(self.bytes.load(Ordering::SeqCst)),
            step: self.step,
        }
    }
}

impl CounterSource for SteadyCounters {
    fn current_counters(&self) -> io::Result<NetCounters> {
        let bytes = self.bytes.fetch_add(self.step, Ordering::SeqCst) + self.step;
        Ok(NetCounters {
            bytes_sent: bytes,
            bytes_recv: 0,
            packets_sent: bytes / 100,
            packets_recv: 0,
        })
    }
}

struct MockProbe;

impl LatencyProbe for MockProbe {
    async fn probe(&self, destination: &str) -> ProbeResult {
        if destination == "unreachable.test" {
            ProbeResult::failed()
        } else {
            ProbeResult {
                latency_ms: 12.5,
                loss_percent: 0.0,
            }
        }
    }
}

struct MockConnections;

impl ConnectionSource for MockConnections {
    fn connection_states(&self) -> io::Result<BTreeMap<String, u64>> {
        Ok([("ESTABLISHED".to_string(), 3)].into_iter().collect())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.monitor.sample_interval_secs = 0.01;
    config.monitor.export_interval_secs = 0.02;
    config.monitor.probe_interval_multiplier = 1;
    config.monitor.probe_destinations = vec!["10.0.0.53".to_string(), "unreachable.test".to_string()];
    config.monitor.metrics_bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.monitor.metrics_port = 0;
    config
}

fn packets() -> ReplaySource {
    let client = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
    let server = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
    ReplaySource::new(vec![
        PacketRecord::ip(client, server, 6, 60).with_tcp(51000, 443, 0x02),
        PacketRecord::ip(server, client, 6, 1400).with_tcp(443, 51000, 0x12),
        PacketRecord::ip(server, client, 6, 9000).with_tcp(443, 51000, 0x10),
        PacketRecord::ip(client, server, 47, 120),
        PacketRecord::non_ip(),
    ])
}

#[tokio::test]
async fn test_session_runs_every_loop_until_shutdown() {
    let (handle, shutdown) = shutdown_channel();
    let parts = SessionParts {
        config: test_config(),
        counters: SteadyCounters::new(1_000),
        probe: MockProbe,
        exporter: SnapshotRecorder::new(),
        packets: Some(packets()),
        connections: Some(Box::new(MockConnections)),
    };

    let session = tokio::spawn(run_session(parts, shutdown));
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.trigger();
    let outcome = session.await.unwrap().unwrap();

    // Steady 100 kB/s stays under the default 1 MB/s floor.
    assert!(outcome.detector.model().sample_count() >= 2);
    assert_eq!(outcome.spikes.spikes_total, 0);
    assert!(!outcome.spikes.latest.unwrap().exceeded);

    assert_eq!(outcome.latency["10.0.0.53"].latency_ms, 12.5);
    assert_eq!(outcome.latency["unreachable.test"], ProbeResult::failed());

    let report = outcome.report.unwrap();
    assert_eq!(report.total_packets, 4);
    assert_eq!(report.ignored_packets, 1);
    assert_eq!(report.oversized_sources.len(), 1);
    assert_eq!(report.unusual_protocols.len(), 1);

    let snapshot = &outcome.last_snapshot;
    assert!(snapshot.tick >= 2);
    assert_eq!(snapshot.value(CLASSIFIED_PACKETS, None), Some(4.0));
    assert_eq!(snapshot.value(OVERSIZED_PACKETS, None), Some(1.0));
    assert_eq!(snapshot.value(RATE_SPIKE, None), Some(0.0));
    assert_eq!(snapshot.value(NETWORK_LATENCY, Some(("destination", "10.0.0.53"))), Some(12.5));
    assert_eq!(snapshot.value(NETWORK_CONNECTIONS, Some(("state", "ESTABLISHED"))), Some(3.0));
    assert_eq!(snapshot.value(NETWORK_BYTES_SENT, None), Some(snapshot.tick as f64 * 1_000.0));

    let recorder = &outcome.exporter;
    assert!(recorder.export_count() >= 1);
    assert_eq!(recorder.get(NETWORK_BYTES_SENT), snapshot.value(NETWORK_BYTES_SENT, None));
    assert_eq!(outcome.metrics.bytes_sent.get() as f64, snapshot.tick as f64 * 1_000.0);
}

#[tokio::test]
async fn test_session_without_capture_has_no_report() {
    let (handle, shutdown) = shutdown_channel();
    let parts = SessionParts {
        config: test_config(),
        counters: SteadyCounters::new(10),
        probe: MockProbe,
        exporter: SnapshotRecorder::new(),
        packets: None::<ReplaySource>,
        connections: None,
    };

    let session = tokio::spawn(run_session(parts, shutdown));
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.trigger();
    let outcome = session.await.unwrap().unwrap();

    assert!(outcome.report.is_none());
    assert_eq!(outcome.last_snapshot.value(CLASSIFIED_PACKETS, None), Some(0.0));
    assert_eq!(outcome.last_snapshot.value(NETWORK_CONNECTIONS, Some(("state", "ESTABLISHED"))), None);
}

fn idle_parts(config: Config) -> SessionParts<SteadyCounters, MockProbe, SnapshotRecorder, ReplaySource> {
    SessionParts {
        config,
        counters: SteadyCounters::new(10),
        probe: MockProbe,
        exporter: SnapshotRecorder::new(),
        packets: None,
        connections: None,
    }
}

#[tokio::test]
async fn test_invalid_interval_fails_at_startup() {
    for secs in [0.0, -1.0, f64::NAN, 1e20] {
        let (_handle, shutdown) = shutdown_channel();
        let mut config = test_config();
        config.monitor.sample_interval_secs = secs;

        assert!(run_session(idle_parts(config), shutdown).await.is_err(), "{} accepted", secs);
    }
}

#[tokio::test]
async fn test_invalid_export_interval_fails_at_startup() {
    let (_handle, shutdown) = shutdown_channel();
    let mut config = test_config();
    config.monitor.export_interval_secs = -0.5;

    assert!(run_session(idle_parts(config), shutdown).await.is_err());
}

#[tokio::test]
async fn test_taken_metrics_port_fails_at_startup() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let (_handle, shutdown) = shutdown_channel();
    let mut config = test_config();
    config.monitor.metrics_port = taken.local_addr().unwrap().port();

    assert!(run_session(idle_parts(config), shutdown).await.is_err());
}
