//! Normalized fit metrics between simulated and observed trajectories.

use std::collections::BTreeMap;

use epidemics_core::{EpidemicModel, ObservedSeries, ParamSet, StateInput, Trajectory};
use serde::{Deserialize, Serialize};

use crate::error::CalResult;

/// Composite loss with its per-column breakdown for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub total: f64,
    pub per_column: BTreeMap<String, f64>,
}

/// Per-column mean squared error normalized by the squared observed peak,
/// summed across columns, square-rooted.
///
/// Peak normalization keeps columns of different magnitude (deaths vs.
/// hospital occupancy) commensurable; a flat-zero observed column falls back
/// to the raw mean squared error. Non-finite observed values are skipped,
/// so gaps in reporting cost nothing.
pub fn custom_loss(observed: &ObservedSeries, predicted: &Trajectory) -> CalResult<LossBreakdown> {
    let mut per_column = BTreeMap::new();
    let mut sum = 0.0;
    for column in observed.columns() {
        let truth = observed.column(column)?;
        let pred = predicted.column(column)?;

        let mut squared = 0.0;
        let mut count = 0usize;
        let mut peak = 0.0f64;
        for (t, p) in truth.iter().zip(pred) {
            if !t.is_finite() {
                continue;
            }
            squared += (t - p) * (t - p);
            count += 1;
            peak = peak.max(*t);
        }
        let mse = if count == 0 {
            0.0
        } else {
            squared / count as f64
        };
        let normalized = if peak > 0.0 { mse / (peak * peak) } else { mse };
        per_column.insert(column.clone(), normalized);
        sum += normalized;
    }
    Ok(LossBreakdown {
        total: sum.sqrt(),
        per_column,
    })
}

/// Feasibility constraint applied to the raw loss, e.g. penalizing parameter
/// sets whose reproduction number falls outside an accepted range.
pub type Constraint<M> = dyn Fn(&M, f64) -> f64;

/// One candidate evaluation: reset the model with `params`, predict over the
/// observed span, and score the fit.
pub fn objective<M: EpidemicModel>(
    model: &mut M,
    observed: &ObservedSeries,
    params: &ParamSet,
    init_state: Option<StateInput>,
    constraint: Option<&Constraint<M>>,
) -> CalResult<LossBreakdown> {
    model.reset(params)?;
    let predicted = model.predict(observed, init_state, 0)?;
    let mut loss = custom_loss(observed, &predicted)?;
    if let Some(constraint) = constraint {
        loss.total = constraint(model, loss.total);
    }
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_of_identical_series_is_zero() {
        let model = epidemics_core::CompartmentalModel::builder(&["I", "R"])
            .with_param("N", 9.0)
            .build()
            .unwrap();
        let predicted = model
            .solve(2, Some(vec![4.0, 5.0].into()), None)
            .unwrap();
        // Build the observed series from the prediction itself.
        let same = ObservedSeries::from_columns(
            ["I", "R"]
                .iter()
                .map(|c| (c.to_string(), predicted.column(c).unwrap().to_vec()))
                .collect(),
        )
        .unwrap();
        let loss = custom_loss(&same, &predicted).unwrap();
        assert_eq!(loss.total, 0.0);
        assert!(loss.per_column.values().all(|&v| v == 0.0));
    }

    #[test]
    fn test_peak_normalization_scales_columns() {
        let observed = ObservedSeries::from_columns(vec![("I".to_string(), vec![0.0, 10.0, 0.0])])
            .unwrap();
        let model = epidemics_core::CompartmentalModel::builder(&["I"])
            .with_param("N", 10.0)
            .build()
            .unwrap();
        let predicted = model.solve(2, Some(vec![10.0].into()), None).unwrap();
        let loss = custom_loss(&observed, &predicted).unwrap();
        // MSE = (100 + 0 + 100) / 3, peak^2 = 100.
        let expected = (200.0 / 3.0) / 100.0;
        assert!((loss.per_column["I"] - expected).abs() < 1e-12);
        assert!((loss.total - expected.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_nan_observations_are_skipped() {
        let observed =
            ObservedSeries::from_columns(vec![("I".to_string(), vec![f64::NAN, 5.0, f64::NAN])])
                .unwrap();
        let model = epidemics_core::CompartmentalModel::builder(&["I"])
            .with_param("N", 5.0)
            .build()
            .unwrap();
        let predicted = model.solve(2, Some(vec![5.0].into()), None).unwrap();
        let loss = custom_loss(&observed, &predicted).unwrap();
        assert_eq!(loss.total, 0.0);
    }
}
