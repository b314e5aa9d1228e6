use std::net::IpAddr;
use std::path::Path;

use log::{debug, info, warn};
use pcap::{Activated, Capture, Device, Linktype};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use thiserror::Error;

use crate::capture::{CaptureEvent, PacketRecord, PacketSource};
use crate::config::CaptureConfig;
use crate::monitor::Shutdown;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const LINUX_SLL_HEADER_LEN: usize = 16;
const IPV6_HEADER_LEN: u16 = 40;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;
const MAX_IPV6_EXTENSION_HEADERS: usize = 8;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Insufficient privileges. Try: sudo setcap cap_net_raw,cap_net_admin=eip ./traffic-sentinel")]
    InsufficientPrivileges,

    #[error("Network interface '{0}' not found. Available interfaces: {1:?}")]
    InterfaceNotFound(String, Vec<String>),

    #[error("Cannot open capture file '{0}': {1}")]
    FileError(String, String),

    #[error("Packet capture failed: {0}")]
    CaptureError(String),

    #[error("Device error: {0}")]
    DeviceError(String),
}

/// Link layer framing of the frames a capture hands us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    LinuxSll,
    RawIp,
    Unsupported(i32),
}

impl From<Linktype> for LinkLayer {
    fn from(linktype: Linktype) -> Self {
        if linktype == Linktype::ETHERNET {
            LinkLayer::Ethernet
        } else if linktype == Linktype::LINUX_SLL {
            LinkLayer::LinuxSll
        } else if linktype == Linktype::RAW
            || linktype == Linktype::IPV4
            || linktype == Linktype::IPV6
        {
            LinkLayer::RawIp
        } else {
            LinkLayer::Unsupported(linktype.0)
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct NetworkStats {
    pub packets_captured: u64,
    pub bytes_captured: u64,
    pub non_ip_frames: u64,
}

pub struct PcapEngine {
    capture: Capture<dyn Activated>,
    link_layer: LinkLayer,
    source_name: String,
    stats: NetworkStats,
}

impl PcapEngine {
    /// Opens a live capture. `None` picks the first device libpcap reports.
    pub fn open_device(interface: Option<&str>, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let available_devices = Self::list_devices()?;

        let interface = interface
            .map(str::to_string)
            .or_else(|| config.interface.clone())
            .unwrap_or_else(|| {
                available_devices
                    .first()
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| "any".to_string())
            });

        if !available_devices.iter().any(|d| d.name == interface) && interface != "any" {
            let device_names: Vec<String> = available_devices.iter().map(|d| d.name.clone()).collect();
            return Err(CaptureError::InterfaceNotFound(interface, device_names));
        }

        info!("Opening live capture on interface: {}", interface);

        let inactive = Capture::from_device(Device::from(interface.as_str()))
            .map_err(|e| CaptureError::DeviceError(e.to_string()))?;

        let active = inactive
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .open()
            .map_err(|e| {
                warn!("Failed to open capture device {}: {}", interface, e);
                CaptureError::InsufficientPrivileges
            })?;

        let link_layer = LinkLayer::from(active.get_datalink());
        Ok(Self {
            capture: active.into(),
            link_layer,
            source_name: interface,
            stats: NetworkStats::default(),
        })
    }

    /// Opens a stored capture file (tcpdump `-w` output).
    pub fn open_file(path: &Path) -> Result<Self, CaptureError> {
        let display = path.display().to_string();
        let offline = Capture::from_file(path).map_err(|e| CaptureError::FileError(display.clone(), e.to_string()))?;

        let link_layer = LinkLayer::from(offline.get_datalink());
        if let LinkLayer::Unsupported(raw) = link_layer {
            warn!("{}: link type {} is not decoded, every frame will be ignored", display, raw);
        }
        info!("Reading packets from {}", display);

        Ok(Self {
            capture: offline.into(),
            link_layer,
            source_name: display,
            stats: NetworkStats::default(),
        })
    }

    pub fn list_devices() -> Result<Vec<Device>, CaptureError> {
        Device::list().map_err(|e| CaptureError::DeviceError(format!("Failed to list devices: {}", e)))
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn get_statistics(&self) -> &NetworkStats {
        &self.stats
    }

    /// Copies raw frames into a pcap savefile until shutdown or end of input.
    /// Returns the number of frames written.
    pub fn record_to_file(&mut self, output: &Path, shutdown: &Shutdown) -> Result<u64, CaptureError> {
        let mut savefile = self
            .capture
            .savefile(output)
            .map_err(|e| CaptureError::FileError(output.display().to_string(), e.to_string()))?;

        info!("Recording {} to {}", self.source_name, output.display());

        let mut written = 0u64;
        while !shutdown.is_triggered() {
            match self.capture.next_packet() {
                Ok(packet) => {
                    self.stats.packets_captured += 1;
                    self.stats.bytes_captured += packet.data.len() as u64;
                    savefile.write(&packet);
                    written += 1;
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => return Err(CaptureError::CaptureError(e.to_string())),
            }
        }

        savefile
            .flush()
            .map_err(|e| CaptureError::CaptureError(format!("Failed to flush savefile: {}", e)))?;
        Ok(written)
    }
}

impl PacketSource for PcapEngine {
    fn next_event(&mut self) -> Result<CaptureEvent, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.stats.packets_captured += 1;
                self.stats.bytes_captured += packet.data.len() as u64;

                let record = decode_frame(self.link_layer, packet.data);
                if record.ip.is_none() {
                    self.stats.non_ip_frames += 1;
                }
                Ok(CaptureEvent::Packet(record))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(CaptureEvent::Idle),
            Err(pcap::Error::NoMorePackets) => {
                debug!("{}: end of capture after {} packets", self.source_name, self.stats.packets_captured);
                Ok(CaptureEvent::Exhausted)
            }
            Err(e) => Err(CaptureError::CaptureError(format!("Packet capture error: {}", e))),
        }
    }
}

/// Decodes one link-layer frame. Anything without a readable IP header
/// comes back as [`PacketRecord::non_ip`].
pub fn decode_frame(link_layer: LinkLayer, data: &[u8]) -> PacketRecord {
    match link_layer {
        LinkLayer::Ethernet => decode_ethernet(data),
        LinkLayer::LinuxSll => {
            if data.len() < LINUX_SLL_HEADER_LEN {
                return PacketRecord::non_ip();
            }
            let ethertype = u16::from_be_bytes([data[14], data[15]]);
            decode_network(ethertype, &data[LINUX_SLL_HEADER_LEN..])
        }
        LinkLayer::RawIp => match data.first().map(|b| b >> 4) {
            Some(4) => decode_network(ETHERTYPE_IPV4, data),
            Some(6) => decode_network(ETHERTYPE_IPV6, data),
            _ => PacketRecord::non_ip(),
        },
        LinkLayer::Unsupported(_) => PacketRecord::non_ip(),
    }
}

fn decode_ethernet(data: &[u8]) -> PacketRecord {
    let Some(ethernet) = EthernetPacket::new(data) else {
        return PacketRecord::non_ip();
    };

    let ethertype = ethernet.get_ethertype();
    if ethertype == EtherTypes::Vlan {
        // 802.1Q: TCI (2 bytes) then the encapsulated ethertype
        let payload = ethernet.payload();
        if payload.len() < 4 {
            return PacketRecord::non_ip();
        }
        let inner = u16::from_be_bytes([payload[2], payload[3]]);
        return decode_network(inner, &payload[4..]);
    }

    decode_network(ethertype.0, ethernet.payload())
}

fn decode_network(ethertype: u16, payload: &[u8]) -> PacketRecord {
    match ethertype {
        ETHERTYPE_IPV4 => {
            let Some(ipv4) = Ipv4Packet::new(payload) else {
                return PacketRecord::non_ip();
            };
            let protocol = ipv4.get_next_level_protocol();
            let record = PacketRecord::ip(
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                protocol.0,
                ipv4.get_total_length(),
            );
            decode_transport(record, protocol, ipv4.payload())
        }
        ETHERTYPE_IPV6 => {
            let Some(ipv6) = Ipv6Packet::new(payload) else {
                return PacketRecord::non_ip();
            };
            let (protocol, upper) = skip_ipv6_extensions(ipv6.get_next_header(), ipv6.payload());
            let record = PacketRecord::ip(
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                protocol.0,
                ipv6.get_payload_length().saturating_add(IPV6_HEADER_LEN),
            );
            match upper {
                Some(payload) => decode_transport(record, protocol, payload),
                None => record,
            }
        }
        _ => PacketRecord::non_ip(),
    }
}

/// Follows hop-by-hop, routing, destination-options and fragment headers to
/// the upper-layer protocol. The payload is `None` when it does not start
/// with that protocol's header: a later fragment, or a truncated chain.
fn skip_ipv6_extensions(mut next: IpNextHeaderProtocol, mut payload: &[u8]) -> (IpNextHeaderProtocol, Option<&[u8]>) {
    for _ in 0..MAX_IPV6_EXTENSION_HEADERS {
        let header_len = match next {
            p if p == IpNextHeaderProtocols::Hopopt
                || p == IpNextHeaderProtocols::Ipv6Route
                || p == IpNextHeaderProtocols::Ipv6Opts =>
            {
                match payload.get(1) {
                    Some(&len) => (usize::from(len) + 1) * 8,
                    None => return (next, None),
                }
            }
            p if p == IpNextHeaderProtocols::Ipv6Frag => {
                let Some(fragment) = payload.get(..IPV6_FRAGMENT_HEADER_LEN) else {
                    return (next, None);
                };
                let offset = u16::from_be_bytes([fragment[2], fragment[3]]) >> 3;
                if offset != 0 {
                    return (IpNextHeaderProtocol(fragment[0]), None);
                }
                IPV6_FRAGMENT_HEADER_LEN
            }
            _ => return (next, Some(payload)),
        };
        let Some(rest) = payload.get(header_len..) else {
            return (next, None);
        };
        next = IpNextHeaderProtocol(payload[0]);
        payload = rest;
    }
    warn!("IPv6 extension header chain too long, stopping at protocol {}", next.0);
    (next, None)
}

fn decode_transport(record: PacketRecord, protocol: IpNextHeaderProtocol, payload: &[u8]) -> PacketRecord {
    if protocol == IpNextHeaderProtocols::Tcp {
        if let Some(tcp) = TcpPacket::new(payload) {
            return record.with_tcp(tcp.get_source(), tcp.get_destination(), u16::from(tcp.get_flags()));
        }
    } else if protocol == IpNextHeaderProtocols::Udp {
        if let Some(udp) = UdpPacket::new(payload) {
            return record.with_udp(udp.get_source(), udp.get_destination());
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TransportKind;
    use std::net::Ipv4Addr;

    const ETHERTYPE_VLAN: u16 = 0x8100;

    fn ipv4_tcp_packet(total_length: u16, flags: u8) -> Vec<u8> {
        let mut ip = vec![
            0x45, 0x00, 0x00, 0x00, // version/ihl, tos, total length (patched below)
            0x00, 0x01, 0x00, 0x00, // id, flags/frag
            0x40, 0x06, 0x00, 0x00, // ttl, protocol=TCP, checksum
            192, 168, 1, 10, // source
            93, 184, 216, 34, // destination
        ];
        ip[2..4].copy_from_slice(&total_length.to_be_bytes());
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&51000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = flags;
        ip.extend(tcp);
        ip
    }

    fn ethernet_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_decode_ethernet_tcp() {
        let frame = ethernet_frame(ETHERTYPE_IPV4, &ipv4_tcp_packet(40, 0x12));
        let record = decode_frame(LinkLayer::Ethernet, &frame);

        let ip = record.ip.expect("ip layer");
        assert_eq!(ip.source, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(ip.protocol, 6);
        assert_eq!(ip.length, 40);

        let transport = record.transport.expect("transport layer");
        assert_eq!(transport.kind, TransportKind::Tcp);
        assert_eq!(transport.destination_port, 443);
        assert_eq!(record.tcp_flags, Some(0x12));
    }

    #[test]
    fn test_decode_raw_ip() {
        let packet = ipv4_tcp_packet(40, 0x02);
        let record = decode_frame(LinkLayer::RawIp, &packet);
        assert_eq!(record.ip.map(|ip| ip.protocol), Some(6));
        assert_eq!(record.tcp_flags, Some(0x02));
    }

    #[test]
    fn test_decode_linux_sll() {
        let mut frame = vec![0u8; 14];
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend(ipv4_tcp_packet(40, 0x10));
        let record = decode_frame(LinkLayer::LinuxSll, &frame);
        assert_eq!(record.transport.map(|t| t.source_port), Some(51000));
    }

    #[test]
    fn test_decode_vlan_tagged() {
        let mut payload = vec![0x00, 0x64];
        payload.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        payload.extend(ipv4_tcp_packet(40, 0x10));
        let frame = ethernet_frame(ETHERTYPE_VLAN, &payload);
        let record = decode_frame(LinkLayer::Ethernet, &frame);
        assert!(record.ip.is_some());
    }

    fn ipv6_packet(next_header: u8, payload: &[u8]) -> Vec<u8> {
        let mut ip = vec![0x60, 0, 0, 0];
        ip.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        ip.extend_from_slice(&[next_header, 64]);
        ip.extend_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]); // source
        ip.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]); // destination
        ip.extend_from_slice(payload);
        ip
    }

    fn tcp_header(destination_port: u16) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&51000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&destination_port.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = 0x02;
        tcp
    }

    #[test]
    fn test_decode_ipv6_through_hop_by_hop_header() {
        // hop-by-hop (next = TCP, 8 bytes) carrying a router alert option
        let mut payload = vec![6, 0, 5, 2, 0, 0, 1, 0];
        payload.extend(tcp_header(443));
        let frame = ethernet_frame(ETHERTYPE_IPV6, &ipv6_packet(0, &payload));
        let record = decode_frame(LinkLayer::Ethernet, &frame);

        let ip = record.ip.expect("ip layer");
        assert_eq!(ip.protocol, 6);
        assert_eq!(ip.length, 40 + 28);
        assert!(!crate::analysis::protocols::is_unusual(ip.protocol));
        let transport = record.transport.expect("transport layer");
        assert_eq!(transport.kind, TransportKind::Tcp);
        assert_eq!(transport.destination_port, 443);
    }

    #[test]
    fn test_decode_ipv6_destination_options_then_udp() {
        // destination options of 16 bytes (length field 1), then UDP to 53
        let mut payload = vec![17, 1];
        payload.extend_from_slice(&[0u8; 14]);
        payload.extend_from_slice(&[0xc3, 0x50, 0x00, 0x35, 0x00, 0x08, 0x00, 0x00]);
        let record = decode_frame(LinkLayer::RawIp, &ipv6_packet(60, &payload));

        assert_eq!(record.ip.map(|ip| ip.protocol), Some(17));
        assert_eq!(record.transport.map(|t| t.destination_port), Some(53));
    }

    #[test]
    fn test_decode_ipv6_later_fragment_keeps_protocol_only() {
        // fragment header: next = TCP, offset 185 (x8 bytes), more fragments
        let mut payload = vec![6, 0, 0x05, 0xc9, 0, 0, 0, 1];
        payload.extend_from_slice(&[0xaa; 24]);
        let record = decode_frame(LinkLayer::RawIp, &ipv6_packet(44, &payload));

        assert_eq!(record.ip.map(|ip| ip.protocol), Some(6));
        assert!(record.transport.is_none());
    }

    #[test]
    fn test_decode_ipv6_truncated_extension_chain() {
        // hop-by-hop claims 16 bytes but only 8 follow
        let payload = vec![6, 1, 0, 0, 0, 0, 0, 0];
        let record = decode_frame(LinkLayer::RawIp, &ipv6_packet(0, &payload));

        assert_eq!(record.ip.map(|ip| ip.protocol), Some(0));
        assert!(record.transport.is_none());
    }

    #[test]
    fn test_non_ip_frames() {
        let arp = ethernet_frame(0x0806, &[0u8; 28]);
        assert_eq!(decode_frame(LinkLayer::Ethernet, &arp), PacketRecord::non_ip());
        assert_eq!(decode_frame(LinkLayer::Ethernet, &[0u8; 4]), PacketRecord::non_ip());
        assert_eq!(decode_frame(LinkLayer::Unsupported(147), &arp), PacketRecord::non_ip());
    }
}
