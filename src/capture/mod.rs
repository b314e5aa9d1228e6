pub mod pcap_engine;
pub mod proc_parser;
pub mod record;

pub use pcap_engine::{decode_frame, CaptureError, LinkLayer, NetworkStats, PcapEngine};
pub use proc_parser::{
    ConnectionSource, CounterSource, InterfaceStats, NetCounters, ProcConnections, ProcNetParser, SocketEntry,
    SysfsCounters, TcpState,
};
pub use record::{CaptureEvent, IpFields, PacketRecord, PacketSource, ReplaySource, TransportFields, TransportKind};
