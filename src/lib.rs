// Library exports for traffic-sentinel
pub mod analysis;
pub mod capture;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod traffic;
pub mod utils;

pub use analysis::{classifier, protocols, report};
pub use capture::{pcap_engine, proc_parser};
pub use config::settings;
pub use metrics::{aggregator, exporter, probe, registry, server};
pub use traffic::{detector, sampler};
pub use utils::formatting;

// Error types
pub use anyhow::{Error, Result};
