use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::analysis::{ClassifierSummary, PacketClassifier};
use crate::capture::{CaptureEvent, CounterSource, PacketSource};
use crate::metrics::{LatencyProbe, LatencyTable, MetricSnapshot, MetricsAggregator, MetricsExporter, SpikeState};
use crate::monitor::Shutdown;
use crate::traffic::{RateSampler, SpikeDetector};

/// Minimum time between two classifier summaries published by the capture loop.
pub const SUMMARY_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// The capture loop gives up after this many read errors in a row.
pub const MAX_CONSECUTIVE_CAPTURE_ERRORS: u32 = 10;

/// Feeds packets to the classifier until shutdown, end of input or a
/// persistently failing source. Blocking: run it under `spawn_blocking`.
pub fn run_capture_loop<S: PacketSource>(
    mut source: S,
    mut classifier: PacketClassifier,
    summary: watch::Sender<ClassifierSummary>,
    shutdown: Shutdown,
) -> PacketClassifier {
    let mut last_publish = Instant::now();
    let mut consecutive_errors = 0;

    while !shutdown.is_triggered() {
        match source.next_event() {
            Ok(CaptureEvent::Packet(record)) => {
                consecutive_errors = 0;
                classifier.classify(&record);
            }
            Ok(CaptureEvent::Idle) => consecutive_errors = 0,
            Ok(CaptureEvent::Exhausted) => {
                info!("Capture source exhausted");
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("Capture read failed ({} in a row): {}", consecutive_errors, e);
                if consecutive_errors >= MAX_CONSECUTIVE_CAPTURE_ERRORS {
                    error!("Stopping capture after {} consecutive errors", consecutive_errors);
                    break;
                }
            }
        }

        if last_publish.elapsed() >= SUMMARY_PUBLISH_INTERVAL {
            summary.send_replace(classifier.summary());
            last_publish = Instant::now();
        }
    }

    summary.send_replace(classifier.summary());
    classifier
}

/// Samples throughput and judges every sample against the spike detector.
pub async fn run_rate_loop<C: CounterSource>(
    mut sampler: RateSampler<C>,
    mut detector: SpikeDetector,
    threshold_floor: f64,
    spikes: watch::Sender<SpikeState>,
    mut shutdown: Shutdown,
) -> SpikeDetector {
    loop {
        let outcome = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            outcome = sampler.sample() => outcome,
        };

        match outcome {
            Ok(sample) => match detector.observe(sample, threshold_floor) {
                Ok(alert) => spikes.send_modify(|state| {
                    if alert.exceeded {
                        state.spikes_total += 1;
                    }
                    state.latest = Some(alert);
                }),
                Err(e) => {
                    warn!("Discarding rate sample: {}", e);
                    spikes.send_modify(|state| state.invalid_samples += 1);
                }
            },
            Err(e) => {
                warn!("{}", e);
                // A failing counter returns immediately; don't spin on it.
                if !shutdown.sleep(sampler.interval()).await {
                    break;
                }
            }
        }
    }

    debug!("Rate loop stopped after {} samples", detector.model().sample_count());
    detector
}

/// Probes every destination, then waits `interval` before the next round.
pub async fn run_probe_loop<P: LatencyProbe>(
    probe: P,
    destinations: Vec<String>,
    interval: Duration,
    latency: watch::Sender<LatencyTable>,
    mut shutdown: Shutdown,
) {
    loop {
        for destination in &destinations {
            let result = tokio::select! {
                biased;
                _ = shutdown.triggered() => return,
                result = probe.probe(destination) => result,
            };
            latency.send_modify(|table| {
                table.insert(destination.clone(), result);
            });
        }

        if !shutdown.sleep(interval).await {
            return;
        }
    }
}

/// Ticks the aggregator every `interval`. Ticks read procfs, so each one runs
/// on the blocking pool.
pub async fn run_metrics_loop<C>(
    mut aggregator: MetricsAggregator<C>,
    interval: Duration,
    snapshots: watch::Sender<MetricSnapshot>,
    mut shutdown: Shutdown,
) -> Result<MetricsAggregator<C>, JoinError>
where
    C: CounterSource + Send + 'static,
{
    loop {
        let (returned, snapshot) = tokio::task::spawn_blocking(move || {
            let snapshot = aggregator.tick();
            (aggregator, snapshot)
        })
        .await?;
        aggregator = returned;
        snapshots.send_replace(snapshot);
        if !shutdown.sleep(interval).await {
            break;
        }
    }
    Ok(aggregator)
}

/// Hands the latest snapshot to `exporter` on its own cadence. Snapshots
/// produced between two exports are skipped.
pub async fn run_export_loop<E: MetricsExporter>(
    mut exporter: E,
    mut snapshots: watch::Receiver<MetricSnapshot>,
    interval: Duration,
    mut shutdown: Shutdown,
) -> E {
    let mut last_tick = 0;
    while shutdown.sleep(interval).await {
        last_tick = export_latest(&mut exporter, &snapshots, last_tick);
    }

    // Wait for the metrics loop to hang up so its final tick is exported.
    while snapshots.changed().await.is_ok() {}
    export_latest(&mut exporter, &snapshots, last_tick);
    exporter
}

fn export_latest<E: MetricsExporter>(
    exporter: &mut E,
    snapshots: &watch::Receiver<MetricSnapshot>,
    last_tick: u64,
) -> u64 {
    let snapshot = snapshots.borrow().clone();
    if snapshot.tick == last_tick {
        return last_tick;
    }
    if let Err(e) = exporter.export(&snapshot) {
        warn!("Metrics export failed: {}", e);
    }
    snapshot.tick
}
