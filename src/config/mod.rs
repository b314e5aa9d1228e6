pub mod settings;

pub use settings::{AnalysisConfig, CaptureConfig, Config, ConfigError, MonitorConfig, ProbeConfig};
