use anyhow::{Context, Result};
use log::info;
use tokio::sync::watch;

use crate::analysis::{ClassifierSummary, PacketClassifier, TrafficReport};
use crate::capture::{ConnectionSource, CounterSource, PacketSource};
use crate::config::Config;
use crate::metrics::{
    LatencyProbe, LatencyTable, MetricSnapshot, MetricsAggregator, MetricsExporter, MetricsServer, NetworkMetrics,
    SpikeState,
};
use crate::monitor::loops::{run_capture_loop, run_export_loop, run_metrics_loop, run_probe_loop, run_rate_loop};
use crate::monitor::Shutdown;
use crate::traffic::{RateSampler, SpikeDetector};

/// Collaborators of a live monitoring session.
pub struct SessionParts<C, P, E, S> {
    pub config: Config,
    /// Cloned once for the rate sampler and once for the aggregator.
    pub counters: C,
    pub probe: P,
    pub exporter: E,
    /// Classification only runs when a packet source is supplied.
    pub packets: Option<S>,
    pub connections: Option<Box<dyn ConnectionSource + Send + Sync>>,
}

/// What is left once every loop has stopped.
pub struct SessionOutcome<E> {
    pub report: Option<TrafficReport>,
    pub detector: SpikeDetector,
    pub spikes: SpikeState,
    pub latency: LatencyTable,
    pub last_snapshot: MetricSnapshot,
    pub exporter: E,
    /// The registry every loop fed; still readable after shutdown.
    pub metrics: NetworkMetrics,
}

/// Runs every monitoring loop until `shutdown` fires, then collects their
/// state.
pub async fn run_session<C, P, E, S>(parts: SessionParts<C, P, E, S>, shutdown: Shutdown) -> Result<SessionOutcome<E>>
where
    C: CounterSource + Clone + Send + 'static,
    P: LatencyProbe + Send + Sync + 'static,
    E: MetricsExporter + Send + 'static,
    S: PacketSource + Send + 'static,
{
    parts.config.validate().context("Invalid monitor configuration")?;
    let monitor = &parts.config.monitor;
    let sample_interval = monitor.sample_interval()?;
    let probe_interval = monitor.probe_interval()?;
    let export_interval = monitor.export_interval()?;

    let sampler = RateSampler::new(parts.counters.clone(), sample_interval).context("Invalid sampling configuration")?;
    let detector = SpikeDetector::new(monitor.spike_baseline);
    let metrics = NetworkMetrics::new().context("Failed to register metrics")?;

    let server = if monitor.serve_metrics {
        Some(MetricsServer::start(metrics.registry(), monitor.metrics_address(), shutdown.clone())?)
    } else {
        None
    };

    let (spike_tx, spike_rx) = watch::channel(SpikeState::default());
    let (latency_tx, latency_rx) = watch::channel(LatencyTable::new());
    let (summary_tx, summary_rx) = watch::channel(ClassifierSummary::default());
    let (snapshot_tx, snapshot_rx) = watch::channel(MetricSnapshot::default());

    let mut aggregator = MetricsAggregator::new(parts.counters, metrics.clone())
        .with_spikes(spike_rx.clone())
        .with_latency(latency_rx.clone());
    if let Some(connections) = parts.connections {
        aggregator = aggregator.with_connections(connections);
    }

    let capture = match parts.packets {
        Some(source) => {
            aggregator = aggregator.with_classifier(summary_rx);
            let classifier = PacketClassifier::from_config(&parts.config.analysis);
            let shutdown = shutdown.clone();
            Some(tokio::task::spawn_blocking(move || {
                run_capture_loop(source, classifier, summary_tx, shutdown)
            }))
        }
        None => None,
    };

    info!(
        "Monitoring every {:?}, probing {:?} every {:?}",
        sample_interval, monitor.probe_destinations, probe_interval
    );

    let rate = tokio::spawn(run_rate_loop(
        sampler,
        detector,
        monitor.spike_threshold_bps,
        spike_tx,
        shutdown.clone(),
    ));
    let probes = tokio::spawn(run_probe_loop(
        parts.probe,
        monitor.probe_destinations.clone(),
        probe_interval,
        latency_tx,
        shutdown.clone(),
    ));
    let metrics_loop = tokio::spawn(run_metrics_loop(
        aggregator,
        sample_interval,
        snapshot_tx,
        shutdown.clone(),
    ));
    let export = tokio::spawn(run_export_loop(
        parts.exporter,
        snapshot_rx.clone(),
        export_interval,
        shutdown,
    ));

    let detector = rate.await.context("Rate loop panicked")?;
    probes.await.context("Probe loop panicked")?;
    metrics_loop
        .await
        .context("Metrics loop panicked")?
        .context("Metrics tick panicked")?;
    let exporter = export.await.context("Export loop panicked")?;
    if let Some(server) = server {
        server.stopped().await.context("Metrics server panicked")?;
    }
    let report = match capture {
        Some(handle) => Some(handle.await.context("Capture loop panicked")?.finalize()),
        None => None,
    };

    let spikes = spike_rx.borrow().clone();
    let latency = latency_rx.borrow().clone();
    let last_snapshot = snapshot_rx.borrow().clone();
    info!(
        "Session finished: {} rate samples, {} spikes, {} metric ticks",
        detector.model().sample_count(),
        spikes.spikes_total,
        last_snapshot.tick
    );

    Ok(SessionOutcome {
        report,
        detector,
        spikes,
        latency,
        last_snapshot,
        exporter,
        metrics,
    })
}
