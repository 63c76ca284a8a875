//! Black-box calibration of compartmental epidemic models.
//!
//! Given an [`EpidemicModel`](epidemics_core::EpidemicModel) with a working
//! `reset`, a search space over its free parameters, and an observed time
//! series, [`ParamsOptimizer`] minimizes the peak-normalized loss between
//! simulation and data with a tree-structured Parzen estimator, supports
//! early stopping and wall-clock budgets, persists results to YAML, and
//! samples the posterior for prediction-interval ensembles.

pub mod error;
pub mod metrics;
pub mod optimizer;
pub mod store;
pub mod types;

pub use error::{CalResult, CalibrationError};
pub use metrics::{custom_loss, objective, Constraint, LossBreakdown};
pub use optimizer::ParamsOptimizer;
pub use store::{CalibrationInfo, CalibrationRecord};
pub use types::{ParamDistribution, ParamRange, RunConfig, SearchSpace, Trial};
