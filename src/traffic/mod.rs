pub mod detector;
pub mod sampler;

pub use detector::{RollingRateModel, SampleError, SpikeAlert, SpikeDetector, ThresholdBaseline, SPIKE_SIGMA};
pub use sampler::{clamped_delta, RateSample, RateSampler, SamplerError};
