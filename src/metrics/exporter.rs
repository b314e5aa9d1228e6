use std::collections::BTreeMap;
use std::io::Write;

use log::info;
use prometheus::proto::{MetricFamily, MetricType};
use serde::Serialize;
use thiserror::Error;

use crate::metrics::registry::{NETWORK_BYTES_RECV, NETWORK_BYTES_SENT};
use crate::utils::formatting::format_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Metric {
    /// `name{label="value",...}`, the identity of one time series.
    pub fn series_key(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

/// Point-in-time copy of a gathered registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// Number of aggregator ticks behind this snapshot.
    pub tick: u64,
    pub metrics: Vec<Metric>,
}

impl MetricSnapshot {
    /// Flattens gathered families into one entry per series. Families of other
    /// types are skipped; nothing here produces them.
    pub fn from_families(tick: u64, families: &[MetricFamily]) -> Self {
        let mut metrics = Vec::new();
        for family in families {
            let kind = match family.get_field_type() {
                MetricType::COUNTER => MetricKind::Counter,
                MetricType::GAUGE => MetricKind::Gauge,
                _ => continue,
            };
            for metric in family.get_metric() {
                let labels = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect();
                let value = match kind {
                    MetricKind::Counter => metric.get_counter().get_value(),
                    MetricKind::Gauge => metric.get_gauge().get_value(),
                };
                metrics.push(Metric {
                    name: family.get_name().to_string(),
                    kind,
                    labels,
                    value,
                });
            }
        }
        Self { tick, metrics }
    }

    /// Value of the first series with this name whose labels include `label`.
    pub fn value(&self, name: &str, label: Option<(&str, &str)>) -> Option<f64> {
        self.metrics
            .iter()
            .filter(|m| m.name == name)
            .find(|m| match label {
                Some((key, value)) => m.labels.get(key).map(String::as_str) == Some(value),
                None => true,
            })
            .map(|m| m.value)
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write metrics: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait MetricsExporter {
    fn export(&mut self, snapshot: &MetricSnapshot) -> Result<(), ExportError>;
}

/// Keeps every exported snapshot's latest value per series, for embedding
/// and tests.
#[derive(Debug, Default)]
pub struct SnapshotRecorder {
    series: BTreeMap<String, f64>,
    exports: u64,
}

impl SnapshotRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, series_key: &str) -> Option<f64> {
        self.series.get(series_key).copied()
    }

    pub fn export_count(&self) -> u64 {
        self.exports
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl MetricsExporter for SnapshotRecorder {
    fn export(&mut self, snapshot: &MetricSnapshot) -> Result<(), ExportError> {
        for metric in &snapshot.metrics {
            self.series.insert(metric.series_key(), metric.value);
        }
        self.exports += 1;
        Ok(())
    }
}

/// Writes each snapshot as one JSON line.
pub struct JsonLinesExporter<W> {
    writer: W,
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MetricsExporter for JsonLinesExporter<W> {
    fn export(&mut self, snapshot: &MetricSnapshot) -> Result<(), ExportError> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Logs a one-line summary per snapshot at info level.
#[derive(Debug, Default)]
pub struct LogExporter;

impl MetricsExporter for LogExporter {
    fn export(&mut self, snapshot: &MetricSnapshot) -> Result<(), ExportError> {
        let bytes = |name| snapshot.value(name, None).unwrap_or(0.0) as u64;
        info!(
            "tick {}: sent {}, received {}, {} series",
            snapshot.tick,
            format_bytes(bytes(NETWORK_BYTES_SENT)),
            format_bytes(bytes(NETWORK_BYTES_RECV)),
            snapshot.metrics.len()
        );
        for metric in snapshot.metrics.iter().filter(|m| m.kind == MetricKind::Gauge) {
            info!("  {} = {}", metric.series_key(), metric.value);
        }
        Ok(())
    }
}
