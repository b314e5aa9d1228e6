use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpFields {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: u8,
    /// Total length of the IP datagram, header included.
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFields {
    pub kind: TransportKind,
    pub source_port: u16,
    pub destination_port: u16,
}

/// One decoded packet as handed over by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub ip: Option<IpFields>,
    pub transport: Option<TransportFields>,
    pub tcp_flags: Option<u16>,
}

impl PacketRecord {
    /// A frame the decoder could not find an IP layer in.
    pub fn non_ip() -> Self {
        Self {
            ip: None,
            transport: None,
            tcp_flags: None,
        }
    }

    pub fn ip(source: IpAddr, destination: IpAddr, protocol: u8, length: u16) -> Self {
        Self {
            ip: Some(IpFields {
                source,
                destination,
                protocol,
                length,
            }),
            transport: None,
            tcp_flags: None,
        }
    }

    pub fn with_tcp(mut self, source_port: u16, destination_port: u16, flags: u16) -> Self {
        self.transport = Some(TransportFields {
            kind: TransportKind::Tcp,
            source_port,
            destination_port,
        });
        self.tcp_flags = Some(flags);
        self
    }

    pub fn with_udp(mut self, source_port: u16, destination_port: u16) -> Self {
        self.transport = Some(TransportFields {
            kind: TransportKind::Udp,
            source_port,
            destination_port,
        });
        self.tcp_flags = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Packet(PacketRecord),
    /// Nothing arrived before the read timeout; live sources only.
    Idle,
    /// The source has no more packets (end of a capture file).
    Exhausted,
}

/// Anything that yields decoded packets one at a time.
pub trait PacketSource {
    fn next_event(&mut self) -> Result<CaptureEvent, CaptureError>;
}

/// Replays an in-memory list of records, then reports exhaustion.
#[derive(Debug, Default)]
pub struct ReplaySource {
    records: VecDeque<PacketRecord>,
}

impl ReplaySource {
    pub fn new(records: impl IntoIterator<Item = PacketRecord>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl PacketSource for ReplaySource {
    fn next_event(&mut self) -> Result<CaptureEvent, CaptureError> {
        Ok(match self.records.pop_front() {
            Some(record) => CaptureEvent::Packet(record),
            None => CaptureEvent::Exhausted,
        })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Udp => write!(f, "UDP"),
        }
    }
}
