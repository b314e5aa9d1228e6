use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::Serialize;

use crate::analysis::classifier::{PortKey, TrafficTallies};
use crate::analysis::protocols;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub key: String,
    pub count: u64,
    /// Share of all classified packets, 0-100.
    pub percent: f64,
}

/// End-of-run summary of a [`PacketClassifier`](crate::analysis::PacketClassifier).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficReport {
    pub total_packets: u64,
    pub ignored_packets: u64,
    pub mtu_threshold: u16,
    pub top_n: usize,
    pub protocols: Vec<ReportEntry>,
    pub unusual_protocols: Vec<ReportEntry>,
    pub top_ports: Vec<ReportEntry>,
    pub oversized_sources: Vec<ReportEntry>,
    pub tcp_flags: Vec<ReportEntry>,
    pub top_sources: Vec<ReportEntry>,
    pub top_destinations: Vec<ReportEntry>,
}

impl TrafficReport {
    pub fn assemble(tallies: &TrafficTallies, mtu_threshold: u16, top_n: usize) -> Self {
        let total = tallies.total_packets;

        Self {
            total_packets: total,
            ignored_packets: tallies.ignored_packets,
            mtu_threshold,
            top_n,
            protocols: entries(&tallies.protocols, total, None, |p| protocols::protocol_label(*p)),
            unusual_protocols: entries(&tallies.unusual_protocols, total, None, |p| {
                protocols::protocol_label(*p)
            }),
            top_ports: entries(&tallies.ports, total, Some(top_n), port_label),
            oversized_sources: entries(&tallies.oversized, total, None, ToString::to_string),
            tcp_flags: entries(&tallies.tcp_flags, total, None, |flags| format!("0x{:03x}", flags)),
            top_sources: entries(&tallies.sources, total, Some(top_n), ToString::to_string),
            top_destinations: entries(&tallies.destinations, total, Some(top_n), ToString::to_string),
        }
    }

    /// Sections in display order, keyed by their serialized name.
    pub fn sections(&self) -> impl Iterator<Item = (&'static str, &[ReportEntry])> {
        [
            ("protocols", self.protocols.as_slice()),
            ("unusual_protocols", self.unusual_protocols.as_slice()),
            ("top_ports", self.top_ports.as_slice()),
            ("oversized_sources", self.oversized_sources.as_slice()),
            ("tcp_flags", self.tcp_flags.as_slice()),
            ("top_sources", self.top_sources.as_slice()),
            ("top_destinations", self.top_destinations.as_slice()),
        ]
        .into_iter()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Orders a tally by count descending, then by key ascending.
pub fn rank<K: Ord + Copy + Hash>(tally: &HashMap<K, u64>) -> Vec<(K, u64)> {
    let mut ranked: Vec<(K, u64)> = tally.iter().map(|(k, v)| (*k, *v)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

pub fn percent_of(count: u64, total: u64) -> f64 {
    if total > 0 {
        (count as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

fn entries<K, F>(tally: &HashMap<K, u64>, total: u64, limit: Option<usize>, label: F) -> Vec<ReportEntry>
where
    K: Ord + Copy + Hash,
    F: Fn(&K) -> String,
{
    let mut ranked = rank(tally);
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
        .into_iter()
        .map(|(key, count)| ReportEntry {
            key: label(&key),
            count,
            percent: percent_of(count, total),
        })
        .collect()
}

fn port_label(key: &PortKey) -> String {
    format!("{}/{}", key.kind, key.port)
}

impl fmt::Display for TrafficReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total packets classified: {}", self.total_packets)?;
        if self.ignored_packets > 0 {
            writeln!(f, "Non-IP packets ignored: {}", self.ignored_packets)?;
        }

        let headings = [
            "Protocol Analysis".to_string(),
            "Unusual Protocols".to_string(),
            format!("Top {} Destination Ports", self.top_n),
            format!("Oversized Packets (> {} bytes) by Source", self.mtu_threshold),
            "TCP Flag Combinations".to_string(),
            format!("Top {} Source IP Addresses", self.top_n),
            format!("Top {} Destination IP Addresses", self.top_n),
        ];

        for (heading, (_, entries)) in headings.iter().zip(self.sections()) {
            writeln!(f)?;
            writeln!(f, "{}:", heading)?;
            if entries.is_empty() {
                writeln!(f, "  (none)")?;
            }
            for entry in entries {
                writeln!(f, "  {} : {} packets ({:.2}%)", entry.key, entry.count, entry.percent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PacketClassifier;
    use crate::capture::{PacketRecord, TransportKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, last))
    }

    #[test]
    fn test_rank_breaks_ties_by_key() {
        let tally: HashMap<u16, u64> = [(8080, 3), (22, 3), (443, 7), (53, 3), (80, 1)].into_iter().collect();
        let ranked = rank(&tally);
        assert_eq!(ranked, vec![(443, 7), (22, 3), (53, 3), (8080, 3), (80, 1)]);
    }

    #[test]
    fn test_top_ports_deterministic_order() {
        let mut classifier = PacketClassifier::new(1500, 5);
        for port in [9000u16, 25, 8443, 110, 3306, 21, 6379] {
            classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 60).with_tcp(50000, port, 0x18));
        }

        let report = classifier.finalize();
        let keys: Vec<&str> = report.top_ports.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["TCP/21", "TCP/25", "TCP/110", "TCP/3306", "TCP/6379"]);
    }

    #[test]
    fn test_same_port_orders_tcp_before_udp() {
        let mut tallies = TrafficTallies::default();
        tallies.total_packets = 4;
        tallies.ports.insert(
            PortKey {
                port: 53,
                kind: TransportKind::Udp,
            },
            2,
        );
        tallies.ports.insert(
            PortKey {
                port: 53,
                kind: TransportKind::Tcp,
            },
            2,
        );

        let report = TrafficReport::assemble(&tallies, 1500, 5);
        assert_eq!(report.top_ports[0].key, "TCP/53");
        assert_eq!(report.top_ports[1].key, "UDP/53");
        assert_eq!(report.top_ports[0].percent, 50.0);
    }

    #[test]
    fn test_protocol_percentages() {
        let mut classifier = PacketClassifier::default();
        for _ in 0..3 {
            classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 60));
        }
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 17, 60));

        let report = classifier.finalize();
        assert_eq!(report.protocols[0].key, "TCP (6)");
        assert_eq!(report.protocols[0].percent, 75.0);
        assert_eq!(report.protocols[1].percent, 25.0);
    }

    #[test]
    fn test_empty_report_has_zero_percentages() {
        let report = TrafficReport::assemble(&TrafficTallies::default(), 1500, 5);
        assert_eq!(report.total_packets, 0);
        assert!(report.sections().all(|(_, entries)| entries.is_empty()));
        assert_eq!(percent_of(5, 0), 0.0);
    }

    #[test]
    fn test_text_rendering() {
        let mut classifier = PacketClassifier::default();
        classifier.classify(&PacketRecord::ip(addr(7), addr(8), 47, 1600));

        let text = classifier.finalize().to_string();
        assert!(text.contains("Total packets classified: 1"));
        assert!(text.contains("GRE (47) : 1 packets (100.00%)"));
        assert!(text.contains("Oversized Packets (> 1500 bytes) by Source:"));
        assert!(text.contains("192.168.0.7 : 1 packets"));
    }

    #[test]
    fn test_json_sections() {
        let report = PacketClassifier::default().finalize();
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        for (name, _) in report.sections() {
            assert!(value[name].is_array(), "missing section {}", name);
        }
    }
}
