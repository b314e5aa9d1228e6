use std::io;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::capture::CounterSource;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Sampling interval must be a positive duration, got {0:?}")]
    InvalidInterval(Duration),

    #[error("Failed to read traffic counters: {0}")]
    CounterRead(#[from] io::Error),
}

/// Throughput over one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSample {
    pub ordinal: u64,
    pub bytes_per_second: f64,
    /// The counter went backwards during this interval and the delta was clamped to 0.
    pub counter_reset: bool,
}

impl RateSample {
    pub fn new(ordinal: u64, bytes_per_second: f64) -> Self {
        Self {
            ordinal,
            bytes_per_second,
            counter_reset: false,
        }
    }
}

/// Delta between two readings of a monotonic counter. A counter that went
/// backwards was reset and contributes nothing.
pub fn clamped_delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Turns a monotonically increasing byte counter into a per-interval rate.
pub struct RateSampler<C> {
    source: C,
    interval: Duration,
    previous: Option<u64>,
    next_ordinal: u64,
}

impl<C: CounterSource> RateSampler<C> {
    pub fn new(source: C, interval: Duration) -> Result<Self, SamplerError> {
        if interval.is_zero() {
            return Err(SamplerError::InvalidInterval(interval));
        }
        Ok(Self {
            source,
            interval,
            previous: None,
            next_ordinal: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits one interval and returns the rate observed over it.
    ///
    /// The first call takes a baseline reading before sleeping. Dropping the
    /// returned future mid-sleep loses nothing: the baseline is kept and the
    /// ordinal is only consumed once a sample is produced.
    pub async fn sample(&mut self) -> Result<RateSample, SamplerError> {
        let previous = match self.previous {
            Some(previous) => previous,
            None => {
                let baseline = self.read_total()?;
                self.previous = Some(baseline);
                baseline
            }
        };

        tokio::time::sleep(self.interval).await;

        let current = match self.read_total() {
            Ok(current) => current,
            Err(e) => {
                // Re-prime next time instead of stretching the interval.
                self.previous = None;
                return Err(e);
            }
        };
        Ok(self.record(previous, current))
    }

    fn read_total(&self) -> Result<u64, SamplerError> {
        Ok(self.source.current_counters()?.total_bytes())
    }

    fn record(&mut self, previous: u64, current: u64) -> RateSample {
        let counter_reset = current < previous;
        if counter_reset {
            warn!(
                "Byte counter went backwards ({} -> {}), treating as a reset",
                previous, current
            );
        }

        let delta = clamped_delta(previous, current);
        let sample = RateSample {
            ordinal: self.next_ordinal,
            bytes_per_second: delta as f64 / self.interval.as_secs_f64(),
            counter_reset,
        };
        debug!("rate sample #{}: {:.1} B/s", sample.ordinal, sample.bytes_per_second);

        self.previous = Some(current);
        self.next_ordinal += 1;
        sample
    }
}
