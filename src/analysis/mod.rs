pub mod classifier;
pub mod protocols;
pub mod report;

pub use classifier::{ClassifierSummary, PacketClassifier, PortKey, TrafficTallies};
pub use protocols::{is_unusual, protocol_label, unusual_protocol_name, UNUSUAL_PROTOCOLS};
pub use report::{ReportEntry, TrafficReport};
