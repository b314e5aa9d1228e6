use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traffic::ThresholdBaseline;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub analysis: AnalysisConfig,
    pub monitor: MonitorConfig,
    pub probe: ProbeConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// IP lengths above this are counted as oversized.
    pub mtu_threshold: u16,
    pub top_n: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_secs: f64,
    /// Floor of the adaptive spike threshold, bytes per second.
    pub spike_threshold_bps: f64,
    pub spike_baseline: ThresholdBaseline,
    /// Latency probes run every `sample_interval_secs * probe_interval_multiplier`.
    pub probe_interval_multiplier: u32,
    pub probe_destinations: Vec<String>,
    pub export_interval_secs: f64,
    /// Restrict host counters to one interface; all non-loopback when unset.
    pub counter_interface: Option<String>,
    pub track_connections: bool,
    /// Serve the registry over HTTP for Prometheus to scrape.
    pub serve_metrics: bool,
    pub metrics_bind_address: IpAddr,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub count: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub snaplen: i32,
    pub timeout_ms: i32,
    pub promiscuous: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mtu_threshold: 1500,
            top_n: 5,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5.0,
            spike_threshold_bps: 1_000_000.0,
            spike_baseline: ThresholdBaseline::PriorSamples,
            probe_interval_multiplier: 6,
            probe_destinations: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            export_interval_secs: 5.0,
            counter_interface: None,
            track_connections: true,
            serve_metrics: true,
            metrics_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            metrics_port: 8000,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: 3,
            timeout_secs: 10,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            snaplen: 65535,
            timeout_ms: 1000,
            promiscuous: false,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Result<Duration, ConfigError> {
        interval("monitor.sample_interval_secs", self.sample_interval_secs)
    }

    pub fn probe_interval(&self) -> Result<Duration, ConfigError> {
        let probe = self
            .sample_interval()?
            .checked_mul(self.probe_interval_multiplier)
            .ok_or_else(|| {
                invalid(
                    "monitor.probe_interval_multiplier",
                    format!(
                        "{} x {}s overflows the probe interval",
                        self.probe_interval_multiplier, self.sample_interval_secs
                    ),
                )
            })?;
        if probe.is_zero() {
            return Err(invalid("monitor.probe_interval_multiplier", "must be greater than 0"));
        }
        Ok(probe)
    }

    pub fn export_interval(&self) -> Result<Duration, ConfigError> {
        interval("monitor.export_interval_secs", self.export_interval_secs)
    }

    pub fn metrics_address(&self) -> SocketAddr {
        SocketAddr::new(self.metrics_bind_address, self.metrics_port)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Rejects values the runtime loops cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis.mtu_threshold == 0 {
            return Err(invalid("analysis.mtu_threshold", "must be greater than 0"));
        }
        if self.analysis.top_n == 0 {
            return Err(invalid("analysis.top_n", "must be greater than 0"));
        }
        self.monitor.sample_interval()?;
        self.monitor.export_interval()?;
        if !self.monitor.spike_threshold_bps.is_finite() || self.monitor.spike_threshold_bps < 0.0 {
            return Err(invalid(
                "monitor.spike_threshold_bps",
                format!("must be a non-negative number, got {}", self.monitor.spike_threshold_bps),
            ));
        }
        self.monitor.probe_interval()?;
        if self.monitor.probe_destinations.iter().any(|d| d.trim().is_empty()) {
            return Err(invalid("monitor.probe_destinations", "contains an empty destination"));
        }
        if self.probe.count == 0 {
            return Err(invalid("probe.count", "must be greater than 0"));
        }
        if self.probe.timeout_secs == 0 {
            return Err(invalid("probe.timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Negative, NaN and out-of-range values are errors, as is anything that
/// rounds down to a zero `Duration`.
fn interval(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(invalid(field, format!("must be a positive number of seconds, got {}", secs))),
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
