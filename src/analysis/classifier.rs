use std::collections::HashMap;
use std::net::IpAddr;

use log::trace;
use serde::Serialize;

use crate::analysis::protocols;
use crate::analysis::report::TrafficReport;
use crate::capture::{PacketRecord, TransportKind};
use crate::config::AnalysisConfig;

/// Destination port key of the port tally. Field order gives the report
/// tiebreak: port first, then transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey {
    pub port: u16,
    pub kind: TransportKind,
}

/// Raw counters accumulated over one analysis run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficTallies {
    pub total_packets: u64,
    pub ignored_packets: u64,
    pub protocols: HashMap<u8, u64>,
    pub unusual_protocols: HashMap<u8, u64>,
    pub ports: HashMap<PortKey, u64>,
    pub oversized: HashMap<IpAddr, u64>,
    pub tcp_flags: HashMap<u16, u64>,
    pub sources: HashMap<IpAddr, u64>,
    pub destinations: HashMap<IpAddr, u64>,
}

/// Cheap view of the classifier state for live gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierSummary {
    pub classified_packets: u64,
    pub ignored_packets: u64,
    pub oversized_packets: u64,
    pub unusual_protocol_packets: u64,
}

pub struct PacketClassifier {
    mtu_threshold: u16,
    top_n: usize,
    tallies: TrafficTallies,
    oversized_packets: u64,
    unusual_packets: u64,
}

impl PacketClassifier {
    pub fn new(mtu_threshold: u16, top_n: usize) -> Self {
        Self {
            mtu_threshold,
            top_n,
            tallies: TrafficTallies::default(),
            oversized_packets: 0,
            unusual_packets: 0,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.mtu_threshold, config.top_n)
    }

    pub fn classify(&mut self, packet: &PacketRecord) {
        let Some(ip) = packet.ip else {
            self.tallies.ignored_packets += 1;
            return;
        };

        let tallies = &mut self.tallies;
        tallies.total_packets += 1;
        *tallies.protocols.entry(ip.protocol).or_insert(0) += 1;
        *tallies.sources.entry(ip.source).or_insert(0) += 1;
        *tallies.destinations.entry(ip.destination).or_insert(0) += 1;

        if protocols::is_unusual(ip.protocol) {
            *tallies.unusual_protocols.entry(ip.protocol).or_insert(0) += 1;
            self.unusual_packets += 1;
        }

        if ip.length > self.mtu_threshold {
            trace!("oversized packet from {}: {} bytes", ip.source, ip.length);
            *tallies.oversized.entry(ip.source).or_insert(0) += 1;
            self.oversized_packets += 1;
        }

        if let Some(transport) = packet.transport {
            let key = PortKey {
                port: transport.destination_port,
                kind: transport.kind,
            };
            *tallies.ports.entry(key).or_insert(0) += 1;

            if transport.kind == TransportKind::Tcp {
                if let Some(flags) = packet.tcp_flags {
                    *tallies.tcp_flags.entry(flags).or_insert(0) += 1;
                }
            }
        }
    }

    /// Snapshot of the tallies as they stand. Does not consume or reset
    /// anything, so repeated calls return equal reports.
    pub fn finalize(&self) -> TrafficReport {
        TrafficReport::assemble(&self.tallies, self.mtu_threshold, self.top_n)
    }

    pub fn summary(&self) -> ClassifierSummary {
        ClassifierSummary {
            classified_packets: self.tallies.total_packets,
            ignored_packets: self.tallies.ignored_packets,
            oversized_packets: self.oversized_packets,
            unusual_protocol_packets: self.unusual_packets,
        }
    }

    pub fn tallies(&self) -> &TrafficTallies {
        &self.tallies
    }

    pub fn reset(&mut self) {
        self.tallies = TrafficTallies::default();
        self.oversized_packets = 0;
        self.unusual_packets = 0;
    }
}

impl Default for PacketClassifier {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_non_ip_packets_are_ignored() {
        let mut classifier = PacketClassifier::default();
        for _ in 0..10 {
            classifier.classify(&PacketRecord::non_ip());
        }

        assert!(classifier.tallies().protocols.is_empty());
        assert_eq!(classifier.tallies().total_packets, 0);
        assert_eq!(classifier.summary().ignored_packets, 10);

        let report = classifier.finalize();
        assert_eq!(report.total_packets, 0);
        assert!(report.sections().all(|(_, entries)| entries.iter().all(|e| e.percent == 0.0)));
    }

    #[test]
    fn test_unusual_protocol_counts() {
        let mut classifier = PacketClassifier::default();
        for &(protocol, _) in protocols::UNUSUAL_PROTOCOLS {
            for _ in 0..3 {
                classifier.classify(&PacketRecord::ip(addr(1), addr(2), protocol, 100));
            }
        }
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 100));

        for &(protocol, _) in protocols::UNUSUAL_PROTOCOLS {
            assert_eq!(classifier.tallies().unusual_protocols[&protocol], 3);
        }
        assert!(!classifier.tallies().unusual_protocols.contains_key(&6));
        assert_eq!(
            classifier.summary().unusual_protocol_packets,
            3 * protocols::UNUSUAL_PROTOCOLS.len() as u64
        );
    }

    #[test]
    fn test_oversized_uses_strict_threshold() {
        let mut classifier = PacketClassifier::new(1500, 5);
        classifier.classify(&PacketRecord::ip(addr(1), addr(9), 17, 1500));
        classifier.classify(&PacketRecord::ip(addr(1), addr(9), 17, 1501));
        classifier.classify(&PacketRecord::ip(addr(2), addr(9), 17, 9000));

        let oversized = &classifier.tallies().oversized;
        assert_eq!(oversized[&addr(1)], 1);
        assert_eq!(oversized[&addr(2)], 1);
        assert_eq!(classifier.summary().oversized_packets, 2);
    }

    #[test]
    fn test_ports_and_flags() {
        let mut classifier = PacketClassifier::default();
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 60).with_tcp(40000, 443, 0x02));
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 60).with_tcp(40001, 443, 0x12));
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 60).with_tcp(40002, 443, 0x02));
        classifier.classify(&PacketRecord::ip(addr(1), addr(3), 17, 80).with_udp(5353, 53));

        let tallies = classifier.tallies();
        let https = PortKey {
            port: 443,
            kind: TransportKind::Tcp,
        };
        let dns = PortKey {
            port: 53,
            kind: TransportKind::Udp,
        };
        assert_eq!(tallies.ports[&https], 3);
        assert_eq!(tallies.ports[&dns], 1);
        assert_eq!(tallies.tcp_flags[&0x02], 2);
        assert_eq!(tallies.tcp_flags[&0x12], 1);
        assert_eq!(tallies.tcp_flags.len(), 2);
    }

    #[test]
    fn test_sources_and_destinations_are_separate() {
        let mut classifier = PacketClassifier::default();
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 6, 60));
        classifier.classify(&PacketRecord::ip(addr(2), addr(1), 6, 60));
        classifier.classify(&PacketRecord::ip(addr(1), addr(3), 6, 60));

        let tallies = classifier.tallies();
        assert_eq!(tallies.sources[&addr(1)], 2);
        assert_eq!(tallies.sources[&addr(2)], 1);
        assert_eq!(tallies.destinations[&addr(1)], 1);
        assert_eq!(tallies.destinations[&addr(3)], 1);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut classifier = PacketClassifier::default();
        for i in 0..50u8 {
            let record = PacketRecord::ip(addr(i % 7), addr(i % 3), 6, 40 + u16::from(i) * 40)
                .with_tcp(30000 + u16::from(i), u16::from(i % 4) + 80, u16::from(i % 3));
            classifier.classify(&record);
        }

        let first = classifier.finalize();
        let second = classifier.finalize();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_reset_clears_tallies() {
        let mut classifier = PacketClassifier::default();
        classifier.classify(&PacketRecord::ip(addr(1), addr(2), 47, 2000));
        classifier.reset();
        assert_eq!(classifier.tallies(), &TrafficTallies::default());
        assert_eq!(classifier.summary(), ClassifierSummary::default());
    }
}
