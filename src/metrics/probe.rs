use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ProbeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeResult {
    pub latency_ms: f64,
    /// 0 to 100.
    pub loss_percent: f64,
}

impl ProbeResult {
    /// What a failed probe reports: no latency, everything lost.
    pub fn failed() -> Self {
        Self {
            latency_ms: 0.0,
            loss_percent: 100.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Refusing to probe destination '{0}'")]
    InvalidDestination(String),

    #[error("Failed to run ping: {0}")]
    Spawn(#[from] io::Error),

    #[error("ping did not finish within {0:?}")]
    Timeout(Duration),

    #[error("ping exited with {0}")]
    Exit(ExitStatus),

    #[error("No round-trip summary in ping output")]
    Unparseable,
}

/// Measures latency and loss towards one destination. Never fails: probe
/// errors are reported as [`ProbeResult::failed`].
pub trait LatencyProbe {
    fn probe(&self, destination: &str) -> impl Future<Output = ProbeResult> + Send;
}

/// Shells out to the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    count: u32,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(count: u32, timeout: Duration) -> Self {
        Self { count, timeout }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.count, config.timeout())
    }

    async fn run(&self, destination: &str) -> Result<ProbeResult, ProbeError> {
        if destination.is_empty() || destination.starts_with('-') {
            return Err(ProbeError::InvalidDestination(destination.to_string()));
        }

        let mut command = Command::new("ping");
        command
            .arg("-n")
            .arg("-c")
            .arg(self.count.to_string())
            .arg(destination)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ProbeError::Exit(output.status));
        }

        parse_ping_output(&String::from_utf8_lossy(&output.stdout)).ok_or(ProbeError::Unparseable)
    }
}

impl LatencyProbe for PingProbe {
    async fn probe(&self, destination: &str) -> ProbeResult {
        match self.run(destination).await {
            Ok(result) => {
                debug!(
                    "{}: {:.2} ms, {:.0}% loss",
                    destination, result.latency_ms, result.loss_percent
                );
                result
            }
            Err(e) => {
                warn!("Latency probe to {} failed: {}", destination, e);
                ProbeResult::failed()
            }
        }
    }
}

/// Extracts the average round trip and the loss figure from ping's summary.
///
/// ```text
/// 3 packets transmitted, 3 received, 0% packet loss, time 2003ms
/// rtt min/avg/max/mdev = 11.203/12.417/13.991/1.160 ms
/// ```
pub fn parse_ping_output(output: &str) -> Option<ProbeResult> {
    let latency_ms = output
        .lines()
        .find(|line| line.contains("min/avg/max"))
        .and_then(|line| line.split('/').nth(4))
        .and_then(|avg| avg.trim().parse::<f64>().ok())?;

    let loss_percent = output
        .lines()
        .find(|line| line.contains("packet loss"))
        .and_then(|line| {
            line.split([',', ' '])
                .find(|token| token.ends_with('%'))
                .and_then(|token| token.trim_end_matches('%').parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    Some(ProbeResult {
        latency_ms,
        loss_percent,
    })
}
