pub mod aggregator;
pub mod exporter;
pub mod probe;
pub mod registry;
pub mod server;

pub use aggregator::{LatencyTable, MetricsAggregator, SpikeState};
pub use exporter::{ExportError, JsonLinesExporter, LogExporter, Metric, MetricKind, MetricSnapshot, MetricsExporter, SnapshotRecorder};
pub use probe::{parse_ping_output, LatencyProbe, PingProbe, ProbeError, ProbeResult};
pub use registry::NetworkMetrics;
pub use server::{MetricsServer, ServerError};
