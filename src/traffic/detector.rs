use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traffic::RateSample;
use crate::utils::formatting::format_bandwidth;

/// Standard deviations above the mean before a rate counts as a spike.
pub const SPIKE_SIGMA: f64 = 2.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("Invalid rate sample #{ordinal}: {value} bytes/s is not a finite non-negative number")]
    InvalidSample { ordinal: u64, value: f64 },

    #[error("Invalid spike threshold: {0} bytes/s")]
    InvalidThreshold(f64),
}

/// Streaming mean and variance (Welford) over every rate seen in a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollingRateModel {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollingRateModel {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Copy of the model with `value` folded in.
    pub fn with(&self, value: f64) -> Self {
        let mut next = *self;
        next.push(value);
        next
    }

    pub fn sample_count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; 0 until two samples exist.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Which samples the adaptive part of the threshold is computed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdBaseline {
    /// Every sample so far, the one being judged included.
    IncludeCurrent,
    /// Every sample before the one being judged.
    #[default]
    PriorSamples,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpikeAlert {
    pub sample: RateSample,
    pub threshold_used: f64,
    pub exceeded: bool,
}

/// Self-tuning rate spike detector.
///
/// The effective threshold is `max(floor, mean + 2σ)` once two samples
/// exist, and the configured floor before that. With the default
/// [`ThresholdBaseline::PriorSamples`], mean and σ come from the samples
/// before the one being judged, which is folded in afterwards; with
/// [`ThresholdBaseline::IncludeCurrent`] it is folded in first, and a lone
/// outlier among five or fewer samples can never exceed the threshold.
/// Statistics are cumulative over the whole session, so one early outlier
/// keeps raising later thresholds.
#[derive(Debug, Clone, Default)]
pub struct SpikeDetector {
    model: RollingRateModel,
    baseline: ThresholdBaseline,
}

impl SpikeDetector {
    pub fn new(baseline: ThresholdBaseline) -> Self {
        Self {
            model: RollingRateModel::default(),
            baseline,
        }
    }

    pub fn model(&self) -> &RollingRateModel {
        &self.model
    }

    pub fn baseline(&self) -> ThresholdBaseline {
        self.baseline
    }

    pub fn observe(&mut self, sample: RateSample, configured_threshold: f64) -> Result<SpikeAlert, SampleError> {
        let value = sample.bytes_per_second;
        if !value.is_finite() || value < 0.0 {
            return Err(SampleError::InvalidSample {
                ordinal: sample.ordinal,
                value,
            });
        }
        if !configured_threshold.is_finite() || configured_threshold < 0.0 {
            return Err(SampleError::InvalidThreshold(configured_threshold));
        }

        let updated = self.model.with(value);
        let threshold_used = if updated.sample_count() < 2 {
            configured_threshold
        } else {
            let basis = match self.baseline {
                ThresholdBaseline::IncludeCurrent => &updated,
                ThresholdBaseline::PriorSamples => &self.model,
            };
            configured_threshold.max(basis.mean() + SPIKE_SIGMA * basis.standard_deviation())
        };
        self.model = updated;

        let exceeded = value > threshold_used;
        if exceeded {
            warn!(
                "Traffic spike: sample #{} at {} exceeds threshold {}",
                sample.ordinal,
                format_bandwidth(value),
                format_bandwidth(threshold_used)
            );
        } else {
            debug!(
                "sample #{}: {:.1} B/s, threshold {:.1} B/s (mean {:.1}, sd {:.1})",
                sample.ordinal,
                value,
                threshold_used,
                self.model.mean(),
                self.model.standard_deviation()
            );
        }

        Ok(SpikeAlert {
            sample,
            threshold_used,
            exceeded,
        })
    }
}
