use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use log::debug;

/// Host-wide traffic counters, monotonically increasing while the
/// interfaces stay up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

impl NetCounters {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_recv)
    }
}

/// Source of the OS byte/packet counters.
pub trait CounterSource {
    fn current_counters(&self) -> io::Result<NetCounters>;
}

/// Source of socket counts grouped by connection state label.
pub trait ConnectionSource {
    fn connection_states(&self) -> io::Result<BTreeMap<String, u64>>;
}

#[derive(Debug, Clone)]
pub struct SocketEntry {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// `None` for connectionless sockets.
    pub state: Option<TcpState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown(u8),
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

pub struct ProcNetParser;

impl ProcNetParser {
    /// Parse a /proc/net socket table (tcp, tcp6, udp, udp6).
    pub fn get_sockets(path: &str, connectionless: bool) -> io::Result<Vec<SocketEntry>> {
        let content = fs::read_to_string(path)?;
        let mut sockets = Vec::new();

        for line in content.lines().skip(1) {
            if let Some(mut entry) = Self::parse_socket_line(line) {
                if connectionless {
                    entry.state = None;
                }
                sockets.push(entry);
            }
        }
        Ok(sockets)
    }

    /// Read the counters of one interface from sysfs.
    pub fn get_interface_stats(interface: &str) -> io::Result<InterfaceStats> {
        let base_path = format!("/sys/class/net/{}/statistics", interface);

        Ok(InterfaceStats {
            interface: interface.to_string(),
            rx_bytes: Self::read_stat_file(&format!("{}/rx_bytes", base_path))?,
            tx_bytes: Self::read_stat_file(&format!("{}/tx_bytes", base_path))?,
            rx_packets: Self::read_stat_file(&format!("{}/rx_packets", base_path))?,
            tx_packets: Self::read_stat_file(&format!("{}/tx_packets", base_path))?,
        })
    }

    /// Get all available network interfaces, loopback and veth pairs excluded.
    pub fn get_interfaces() -> io::Result<Vec<String>> {
        let mut interfaces = Vec::new();

        for entry in fs::read_dir("/sys/class/net")? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with("lo") && !name.starts_with("veth") {
                    interfaces.push(name.to_string());
                }
            }
        }

        interfaces.sort();
        Ok(interfaces)
    }

    fn parse_socket_line(line: &str) -> Option<SocketEntry> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }

        let local_addr = Self::parse_address(fields[1])?;
        let remote_addr = Self::parse_address(fields[2])?;
        let state_num = u8::from_str_radix(fields[3], 16).ok()?;

        Some(SocketEntry {
            local_addr,
            remote_addr,
            state: Some(Self::parse_tcp_state(state_num)),
        })
    }

    /// Parse address from kernel hex format: 8 (IPv4) or 32 (IPv6) hex
    /// digits of little-endian words, then a big-endian port.
    pub fn parse_address(addr_str: &str) -> Option<SocketAddr> {
        let (ip_hex, port_hex) = addr_str.split_once(':')?;
        let port = u16::from_str_radix(port_hex, 16).ok()?;

        match ip_hex.len() {
            8 => {
                let word = u32::from_str_radix(ip_hex, 16).ok()?;
                let ip = Ipv4Addr::from(word.swap_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            32 => {
                let mut octets = [0u8; 16];
                for (i, chunk) in octets.chunks_mut(4).enumerate() {
                    let word = u32::from_str_radix(&ip_hex[i * 8..i * 8 + 8], 16).ok()?;
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
                Some(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
            }
            _ => None,
        }
    }

    /// Convert numeric TCP state to enum
    pub fn parse_tcp_state(state: u8) -> TcpState {
        match state {
            0x01 => TcpState::Established,
            0x02 => TcpState::SynSent,
            0x03 => TcpState::SynRecv,
            0x04 => TcpState::FinWait1,
            0x05 => TcpState::FinWait2,
            0x06 => TcpState::TimeWait,
            0x07 => TcpState::Close,
            0x08 => TcpState::CloseWait,
            0x09 => TcpState::LastAck,
            0x0A => TcpState::Listen,
            0x0B => TcpState::Closing,
            _ => TcpState::Unknown(state),
        }
    }

    fn read_stat_file(path: &str) -> io::Result<u64> {
        let content = fs::read_to_string(path)?;
        content.trim().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse stat file {}: {}", path, e),
            )
        })
    }
}

/// Sums sysfs interface counters, either for one interface or for every
/// non-loopback interface.
#[derive(Debug, Clone, Default)]
pub struct SysfsCounters {
    interface: Option<String>,
}

impl SysfsCounters {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }
}

impl CounterSource for SysfsCounters {
    fn current_counters(&self) -> io::Result<NetCounters> {
        let interfaces = match &self.interface {
            Some(name) => vec![name.clone()],
            None => ProcNetParser::get_interfaces()?,
        };

        let mut counters = NetCounters::default();
        for interface in &interfaces {
            let stats = ProcNetParser::get_interface_stats(interface)?;
            counters.bytes_sent += stats.tx_bytes;
            counters.bytes_recv += stats.rx_bytes;
            counters.packets_sent += stats.tx_packets;
            counters.packets_recv += stats.rx_packets;
        }
        Ok(counters)
    }
}

/// Counts sockets from /proc/net by state; connectionless sockets are
/// reported under `NONE`.
#[derive(Debug, Clone, Default)]
pub struct ProcConnections;

impl ProcConnections {
    const TABLES: [(&'static str, bool); 4] = [
        ("/proc/net/tcp", false),
        ("/proc/net/tcp6", false),
        ("/proc/net/udp", true),
        ("/proc/net/udp6", true),
    ];
}

impl ConnectionSource for ProcConnections {
    fn connection_states(&self) -> io::Result<BTreeMap<String, u64>> {
        let mut states = BTreeMap::new();

        for (path, connectionless) in Self::TABLES {
            let sockets = match ProcNetParser::get_sockets(path, connectionless) {
                Ok(sockets) => sockets,
                // IPv6 tables vanish when the stack is disabled
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} not present, skipping", path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for socket in sockets {
                *states.entry(state_label(socket.state.as_ref())).or_insert(0) += 1;
            }
        }
        Ok(states)
    }
}

pub fn state_label(state: Option<&TcpState>) -> String {
    match state {
        Some(state) => state.to_string(),
        None => "NONE".to_string(),
    }
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpState::Established => write!(f, "ESTABLISHED"),
            TcpState::SynSent => write!(f, "SYN_SENT"),
            TcpState::SynRecv => write!(f, "SYN_RECV"),
            TcpState::FinWait1 => write!(f, "FIN_WAIT1"),
            TcpState::FinWait2 => write!(f, "FIN_WAIT2"),
            TcpState::TimeWait => write!(f, "TIME_WAIT"),
            TcpState::Close => write!(f, "CLOSE"),
            TcpState::CloseWait => write!(f, "CLOSE_WAIT"),
            TcpState::LastAck => write!(f, "LAST_ACK"),
            TcpState::Listen => write!(f, "LISTEN"),
            TcpState::Closing => write!(f, "CLOSING"),
            TcpState::Unknown(state) => write!(f, "UNKNOWN({})", state),
        }
    }
}
