//! Prometheus collectors for everything the monitor exports.

use prometheus::core::Collector;
use prometheus::{Gauge, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::metrics::exporter::MetricSnapshot;

pub const NETWORK_BYTES_SENT: &str = "network_bytes_sent_total";
pub const NETWORK_BYTES_RECV: &str = "network_bytes_recv_total";
pub const NETWORK_PACKETS_SENT: &str = "network_packets_sent_total";
pub const NETWORK_PACKETS_RECV: &str = "network_packets_recv_total";
pub const NETWORK_LATENCY: &str = "network_latency_ms";
pub const NETWORK_PACKET_LOSS: &str = "network_packet_loss_percent";
pub const NETWORK_CONNECTIONS: &str = "network_connections";
pub const RATE_BYTES_PER_SECOND: &str = "network_rate_bytes_per_second";
pub const RATE_THRESHOLD: &str = "network_rate_threshold_bytes_per_second";
pub const RATE_SPIKE: &str = "network_rate_spike";
pub const RATE_SPIKES_TOTAL: &str = "network_rate_spikes_total";
pub const CLASSIFIED_PACKETS: &str = "traffic_classified_packets";
pub const IGNORED_PACKETS: &str = "traffic_ignored_packets";
pub const OVERSIZED_PACKETS: &str = "traffic_oversized_packets";
pub const UNUSUAL_PROTOCOL_PACKETS: &str = "traffic_unusual_protocol_packets";

/// Collectors registered on one private [`Registry`].
#[derive(Clone)]
pub struct NetworkMetrics {
    registry: Registry,

    pub bytes_sent: IntCounter,
    pub bytes_recv: IntCounter,
    pub packets_sent: IntCounter,
    pub packets_recv: IntCounter,

    pub latency: GaugeVec,
    pub packet_loss: GaugeVec,
    pub connections: GaugeVec,

    pub rate: Gauge,
    pub rate_threshold: Gauge,
    pub rate_spike: IntGauge,
    pub spikes_total: IntCounter,

    pub classified_packets: IntGauge,
    pub ignored_packets: IntGauge,
    pub oversized_packets: IntGauge,
    pub unusual_protocol_packets: IntGauge,
}

impl NetworkMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let bytes_sent = IntCounter::new(NETWORK_BYTES_SENT, "Total network bytes sent")?;
        let bytes_recv = IntCounter::new(NETWORK_BYTES_RECV, "Total network bytes received")?;
        let packets_sent = IntCounter::new(NETWORK_PACKETS_SENT, "Total packets sent")?;
        let packets_recv = IntCounter::new(NETWORK_PACKETS_RECV, "Total packets received")?;

        let latency = GaugeVec::new(Opts::new(NETWORK_LATENCY, "Network latency in ms"), &["destination"])?;
        let packet_loss = GaugeVec::new(
            Opts::new(NETWORK_PACKET_LOSS, "Percentage of packets lost"),
            &["destination"],
        )?;
        let connections = GaugeVec::new(
            Opts::new(NETWORK_CONNECTIONS, "Number of network connections"),
            &["state"],
        )?;

        let rate = Gauge::new(RATE_BYTES_PER_SECOND, "Throughput over the last sampling interval")?;
        let rate_threshold = Gauge::new(RATE_THRESHOLD, "Spike threshold applied to the last sample")?;
        let rate_spike = IntGauge::new(RATE_SPIKE, "1 when the last sample exceeded the threshold")?;
        let spikes_total = IntCounter::new(RATE_SPIKES_TOTAL, "Samples flagged as traffic spikes")?;

        let classified_packets = IntGauge::new(CLASSIFIED_PACKETS, "IP packets classified so far")?;
        let ignored_packets = IntGauge::new(IGNORED_PACKETS, "Captured frames without an IP layer")?;
        let oversized_packets = IntGauge::new(OVERSIZED_PACKETS, "Packets above the MTU threshold")?;
        let unusual_protocol_packets =
            IntGauge::new(UNUSUAL_PROTOCOL_PACKETS, "Packets carrying an unusual IP protocol")?;

        let collectors: [Box<dyn Collector>; 15] = [
            Box::new(bytes_sent.clone()),
            Box::new(bytes_recv.clone()),
            Box::new(packets_sent.clone()),
            Box::new(packets_recv.clone()),
            Box::new(latency.clone()),
            Box::new(packet_loss.clone()),
            Box::new(connections.clone()),
            Box::new(rate.clone()),
            Box::new(rate_threshold.clone()),
            Box::new(rate_spike.clone()),
            Box::new(spikes_total.clone()),
            Box::new(classified_packets.clone()),
            Box::new(ignored_packets.clone()),
            Box::new(oversized_packets.clone()),
            Box::new(unusual_protocol_packets.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            bytes_sent,
            bytes_recv,
            packets_sent,
            packets_recv,
            latency,
            packet_loss,
            connections,
            rate,
            rate_threshold,
            rate_spike,
            spikes_total,
            classified_packets,
            ignored_packets,
            oversized_packets,
            unusual_protocol_packets,
        })
    }

    /// Handle on the underlying registry; clones share the same collectors.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn snapshot(&self, tick: u64) -> MetricSnapshot {
        MetricSnapshot::from_families(tick, &self.registry.gather())
    }

    /// Prometheus text exposition of the current values.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        encode_text(&self.registry)
    }
}

pub fn encode_text(registry: &Registry) -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&registry.gather())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_collector_is_registered() {
        let metrics = NetworkMetrics::new().unwrap();
        metrics.latency.with_label_values(&["8.8.8.8"]).set(12.5);
        metrics.connections.with_label_values(&["LISTEN"]).set(3.0);

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        for name in [
            NETWORK_BYTES_SENT,
            NETWORK_PACKETS_RECV,
            NETWORK_LATENCY,
            NETWORK_CONNECTIONS,
            RATE_SPIKES_TOTAL,
            UNUSUAL_PROTOCOL_PACKETS,
        ] {
            assert!(names.iter().any(|n| n == name), "{} not registered", name);
        }
    }

    #[test]
    fn test_counters_only_move_forward() {
        let metrics = NetworkMetrics::new().unwrap();
        metrics.bytes_sent.inc_by(1500);
        metrics.bytes_sent.inc_by(0);
        assert_eq!(metrics.bytes_sent.get(), 1500);
    }

    #[test]
    fn test_text_exposition() {
        let metrics = NetworkMetrics::new().unwrap();
        metrics.bytes_recv.inc_by(42);
        metrics.packet_loss.with_label_values(&["1.1.1.1"]).set(100.0);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("# TYPE network_bytes_recv_total counter"));
        assert!(text.contains("network_bytes_recv_total 42"));
        assert!(text.contains("network_packet_loss_percent{destination=\"1.1.1.1\"} 100"));
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let first = NetworkMetrics::new().unwrap();
        let second = NetworkMetrics::new().unwrap();
        first.bytes_sent.inc_by(10);
        assert_eq!(second.bytes_sent.get(), 0);
    }
}
