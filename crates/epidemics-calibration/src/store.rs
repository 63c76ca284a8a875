//! Durable storage of calibration results as human-readable YAML.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CalResult;
use crate::metrics::LossBreakdown;

/// Persisted outcome of one calibration run.
///
/// The three top-level keys (`calibrated_params`, `default_params`, `info`)
/// round-trip losslessly through YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Best parameter values found by the search.
    pub calibrated_params: BTreeMap<String, f64>,
    /// Scalar model parameters that were not searched.
    pub default_params: BTreeMap<String, f64>,
    pub info: CalibrationInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInfo {
    /// RFC 3339 timestamp of the run.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub loss: LossBreakdown,
    /// Observed columns the model was fitted on.
    pub on: Vec<String>,
    /// Initial state used for every evaluation, by compartment.
    pub init_state: BTreeMap<String, f64>,
}

impl CalibrationRecord {
    pub fn save(&self, path: impl AsRef<Path>) -> CalResult<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> CalResult<Self> {
        Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
    }

    /// Timestamped default name, `calibration_params_{unix}.yaml`.
    pub fn default_filename() -> PathBuf {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        PathBuf::from(format!("calibration_params_{unix}.yaml"))
    }
}
