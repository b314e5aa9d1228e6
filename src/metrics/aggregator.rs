use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::analysis::ClassifierSummary;
use crate::capture::{ConnectionSource, CounterSource, NetCounters};
use crate::metrics::exporter::MetricSnapshot;
use crate::metrics::probe::ProbeResult;
use crate::metrics::registry::NetworkMetrics;
use crate::traffic::{clamped_delta, SpikeAlert};

/// What the rate loop publishes after every sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpikeState {
    pub latest: Option<SpikeAlert>,
    pub spikes_total: u64,
    pub invalid_samples: u64,
}

/// Latest probe outcome per destination.
pub type LatencyTable = BTreeMap<String, ProbeResult>;

/// Feeds the exported collectors on every tick.
///
/// Host counters are read directly; everything produced by other loops is
/// read from `watch` channels, so a tick never waits on them. Reading the
/// host counters and connection table touches procfs, so `tick` blocks.
pub struct MetricsAggregator<C> {
    counters: C,
    metrics: NetworkMetrics,
    previous: NetCounters,
    spikes_seen: u64,
    ticks: u64,
    spikes: Option<watch::Receiver<SpikeState>>,
    latency: Option<watch::Receiver<LatencyTable>>,
    classifier: Option<watch::Receiver<ClassifierSummary>>,
    connections: Option<Box<dyn ConnectionSource + Send + Sync>>,
}

impl<C: CounterSource> MetricsAggregator<C> {
    /// The first tick exports the full OS counters, so exported totals track
    /// the host's own figures.
    pub fn new(counters: C, metrics: NetworkMetrics) -> Self {
        Self {
            counters,
            metrics,
            previous: NetCounters::default(),
            spikes_seen: 0,
            ticks: 0,
            spikes: None,
            latency: None,
            classifier: None,
            connections: None,
        }
    }

    pub fn with_spikes(mut self, spikes: watch::Receiver<SpikeState>) -> Self {
        self.spikes = Some(spikes);
        self
    }

    pub fn with_latency(mut self, latency: watch::Receiver<LatencyTable>) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_classifier(mut self, classifier: watch::Receiver<ClassifierSummary>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_connections(mut self, connections: Box<dyn ConnectionSource + Send + Sync>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    pub fn tick(&mut self) -> MetricSnapshot {
        self.apply_counter_deltas();
        self.ticks += 1;

        if let Some(spikes) = &self.spikes {
            let state = spikes.borrow().clone();
            self.metrics
                .spikes_total
                .inc_by(clamped_delta(self.spikes_seen, state.spikes_total));
            self.spikes_seen = self.spikes_seen.max(state.spikes_total);
            if let Some(alert) = state.latest {
                self.metrics.rate.set(alert.sample.bytes_per_second);
                self.metrics.rate_threshold.set(alert.threshold_used);
                self.metrics.rate_spike.set(i64::from(alert.exceeded));
            }
        }

        if let Some(classifier) = &self.classifier {
            let summary = *classifier.borrow();
            self.metrics.classified_packets.set(gauge_count(summary.classified_packets));
            self.metrics.ignored_packets.set(gauge_count(summary.ignored_packets));
            self.metrics.oversized_packets.set(gauge_count(summary.oversized_packets));
            self.metrics
                .unusual_protocol_packets
                .set(gauge_count(summary.unusual_protocol_packets));
        }

        if let Some(latency) = &self.latency {
            for (destination, result) in latency.borrow().iter() {
                let labels = [destination.as_str()];
                self.metrics.latency.with_label_values(&labels).set(result.latency_ms);
                self.metrics.packet_loss.with_label_values(&labels).set(result.loss_percent);
            }
        }

        if let Some(connections) = &self.connections {
            match connections.connection_states() {
                Ok(states) => {
                    // States that disappeared must not linger with stale counts.
                    self.metrics.connections.reset();
                    for (state, count) in &states {
                        self.metrics.connections.with_label_values(&[state.as_str()]).set(*count as f64);
                    }
                }
                Err(e) => warn!("Failed to read connection states: {}", e),
            }
        }

        self.metrics.snapshot(self.ticks)
    }

    fn apply_counter_deltas(&mut self) {
        let current = match self.counters.current_counters() {
            Ok(current) => current,
            Err(e) => {
                warn!("Failed to read network counters, skipping this tick: {}", e);
                return;
            }
        };

        let previous = self.previous;
        let metrics = &self.metrics;
        metrics
            .bytes_sent
            .inc_by(counter_delta("bytes_sent", previous.bytes_sent, current.bytes_sent));
        metrics
            .bytes_recv
            .inc_by(counter_delta("bytes_recv", previous.bytes_recv, current.bytes_recv));
        metrics
            .packets_sent
            .inc_by(counter_delta("packets_sent", previous.packets_sent, current.packets_sent));
        metrics
            .packets_recv
            .inc_by(counter_delta("packets_recv", previous.packets_recv, current.packets_recv));
        self.previous = current;
    }
}

fn gauge_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn counter_delta(name: &str, previous: u64, current: u64) -> u64 {
    if current < previous {
        warn!("Counter {} reset ({} -> {}), delta not applied", name, previous, current);
    } else {
        debug!("{}: +{}", name, current - previous);
    }
    clamped_delta(previous, current)
}
