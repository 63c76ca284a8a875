//! Search-space declarations and run configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use epidemics_core::ParamSet;
use serde::{Deserialize, Serialize};

/// Sampling distribution for one free parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamRange {
    /// Continuous uniform over `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Gaussian prior, sampled directly rather than informed by history.
    Normal { mean: f64, std: f64 },
}

/// Free parameters to search, by name.
pub type SearchSpace = BTreeMap<String, ParamRange>;

/// One completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub number: usize,
    pub params: ParamSet,
    pub value: f64,
}

/// Posterior summary of one parameter over the quantile-filtered trials.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamDistribution {
    /// Value in the best trial.
    pub best: f64,
    pub mean: f64,
    pub std: f64,
    /// Empirical 2.5th percentile.
    pub p2_5: f64,
    /// Empirical 97.5th percentile.
    pub p97_5: f64,
}

/// Trial-loop settings. Only the trial budget is mandatory.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub(crate) n_trials: usize,
    pub(crate) early_stopping: Option<usize>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) n_jobs: usize,
    pub(crate) save: bool,
    pub(crate) filename: Option<PathBuf>,
    pub(crate) message: Option<String>,
}

impl RunConfig {
    pub fn new(n_trials: usize) -> Self {
        Self {
            n_trials,
            early_stopping: None,
            timeout: None,
            n_jobs: 1,
            save: false,
            filename: None,
            message: None,
        }
    }

    /// Stop after this many consecutive trials without improvement.
    pub fn with_early_stopping(mut self, patience: usize) -> Self {
        self.early_stopping = Some(patience);
        self
    }

    /// Stop once the wall-clock budget is spent; the running trial finishes.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Worker count. Anything other than 1 is rejected at run time.
    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs;
        self
    }

    /// Persist the calibration record when the run completes.
    pub fn with_save(mut self) -> Self {
        self.save = true;
        self
    }

    pub fn with_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.filename = Some(path.into());
        self
    }

    /// Free-text note stored in the persisted record.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
