//! IANA protocol numbers the classifier cares about.

/// Protocols rarely seen on ordinary host traffic. Any packet carrying one
/// of these is tallied separately as an anomaly.
pub const UNUSUAL_PROTOCOLS: &[(u8, &str)] = &[
    (0, "HOPOPT"),
    (2, "IGMP"),
    (4, "IPv4-in-IPv4"),
    (41, "IPv6-encap"),
    (46, "RSVP"),
    (47, "GRE"),
    (50, "ESP"),
    (51, "AH"),
    (88, "EIGRP"),
    (89, "OSPF"),
    (94, "IPIP"),
    (103, "PIM"),
    (112, "VRRP"),
    (115, "L2TP"),
    (132, "SCTP"),
    (137, "MPLS-in-IP"),
];

pub fn unusual_protocol_name(protocol: u8) -> Option<&'static str> {
    UNUSUAL_PROTOCOLS
        .iter()
        .find(|(number, _)| *number == protocol)
        .map(|(_, name)| *name)
}

pub fn is_unusual(protocol: u8) -> bool {
    unusual_protocol_name(protocol).is_some()
}

/// Display name for a protocol number, e.g. `TCP (6)` or `253`.
pub fn protocol_label(protocol: u8) -> String {
    let name = match protocol {
        1 => Some("ICMP"),
        6 => Some("TCP"),
        17 => Some("UDP"),
        58 => Some("ICMPv6"),
        other => unusual_protocol_name(other),
    };
    match name {
        Some(name) => format!("{} ({})", name, protocol),
        None => protocol.to_string(),
    }
}
