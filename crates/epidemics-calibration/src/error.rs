use epidemics_core::EpiError;
use thiserror::Error;

pub type CalResult<T> = Result<T, CalibrationError>;

/// Errors raised by the calibration layer.
///
/// Early stopping and timeouts are not errors; the trial loop terminates on
/// them internally and keeps the best result found so far.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("parallel optimization is not supported (requested {0} workers, only 1 allowed)")]
    ParallelUnsupported(usize),

    #[error("the search space is empty")]
    EmptySpace,

    #[error("no completed trials; run the optimizer first")]
    NoTrials,

    #[error("invalid range for parameter `{name}`: {reason}")]
    InvalidRange { name: String, reason: String },

    #[error("sampler failed for parameter `{name}`: {reason}")]
    Sampler { name: String, reason: String },

    #[error(transparent)]
    Model(#[from] EpiError),

    #[error("failed to persist calibration record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize calibration record: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
