//! Observed data tables, simulation trajectories, and ensembles.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};

use crate::error::{EpiError, EpiResult};

/// Time-indexed table of observed compartment values (daily cases, deaths,
/// occupancy, …), orderable by date and sliceable by column name.
///
/// Missing values are `NaN` and are filled locally, never raised as errors.
#[derive(Debug, Clone)]
pub struct ObservedSeries {
    start_date: Option<NaiveDate>,
    columns: Vec<String>,
    data: HashMap<String, Vec<f64>>,
    len: usize,
}

impl ObservedSeries {
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> EpiResult<Self> {
        let len = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        if columns.iter().any(|(_, v)| v.len() != len) {
            return Err(EpiError::InvalidInput(
                "observed series columns must all have the same length".into(),
            ));
        }
        let names = columns.iter().map(|(n, _)| n.clone()).collect();
        let data = columns.into_iter().collect();
        Ok(Self {
            start_date: None,
            columns: names,
            data,
            len,
        })
    }

    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> EpiResult<&[f64]> {
        self.data
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| EpiError::UnknownCompartment(name.to_string()))
    }

    /// Replace exact zeros with `NaN` so `interpolate_missing` treats them as
    /// gaps (reporting holes often show up as zero counts).
    pub fn mask_zeros(&mut self) {
        for values in self.data.values_mut() {
            for v in values.iter_mut() {
                if *v == 0.0 {
                    *v = f64::NAN;
                }
            }
        }
    }

    /// Linearly interpolate interior `NaN` gaps; leading and trailing gaps
    /// are held at the nearest finite value.
    pub fn interpolate_missing(&mut self) {
        for values in self.data.values_mut() {
            fill_gaps(values);
        }
    }
}

fn fill_gaps(values: &mut [f64]) {
    let finite: Vec<usize> = (0..values.len()).filter(|&i| values[i].is_finite()).collect();
    if finite.is_empty() {
        return;
    }
    for i in 0..finite[0] {
        values[i] = values[finite[0]];
    }
    for w in finite.windows(2) {
        let (a, b) = (w[0], w[1]);
        if b > a + 1 {
            let (va, vb) = (values[a], values[b]);
            for i in (a + 1)..b {
                let frac = (i - a) as f64 / (b - a) as f64;
                values[i] = va + frac * (vb - va);
            }
        }
    }
    for i in (finite[finite.len() - 1] + 1)..values.len() {
        values[i] = values[finite[finite.len() - 1]];
    }
}

/// One simulation output: an ordered sequence of compartment values per time
/// point, with day labels, optional calendar dates, and aggregate columns
/// summing each base state across its dimension expansion.
#[derive(Debug, Clone)]
pub struct Trajectory {
    days: Vec<i64>,
    dates: Option<Vec<NaiveDate>>,
    columns: Vec<String>,
    data: HashMap<String, Vec<f64>>,
}

impl Trajectory {
    /// Build from row-major integrator output; `rows[i][j]` is compartment
    /// `j` at time point `i`.
    pub(crate) fn from_rows(compartments: &[String], rows: &[Vec<f64>], days: Vec<i64>) -> Self {
        let mut data: HashMap<String, Vec<f64>> = compartments
            .iter()
            .map(|c| (c.clone(), Vec::with_capacity(rows.len())))
            .collect();
        for row in rows {
            for (j, name) in compartments.iter().enumerate() {
                if let Some(col) = data.get_mut(name) {
                    col.push(row[j]);
                }
            }
        }
        Self {
            days,
            dates: None,
            columns: compartments.to_vec(),
            data,
        }
    }

    /// Add one aggregate column per base state, summing the compartments in
    /// `groups`. Bases that already are plain columns are left alone.
    pub(crate) fn build_aggregates(&mut self, groups: &[(String, Vec<String>)]) {
        for (base, members) in groups {
            if self.data.contains_key(base) {
                continue;
            }
            let mut agg = vec![0.0; self.days.len()];
            for member in members {
                if let Some(col) = self.data.get(member) {
                    for (acc, v) in agg.iter_mut().zip(col) {
                        *acc += v;
                    }
                }
            }
            self.columns.push(base.clone());
            self.data.insert(base.clone(), agg);
        }
    }

    pub(crate) fn set_dates(&mut self, start: NaiveDate) {
        self.dates = Some(
            self.days
                .iter()
                .map(|&d| start + Duration::days(d))
                .collect(),
        );
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Day labels; negative when the model carries a negative offset.
    pub fn days(&self) -> &[i64] {
        &self.days
    }

    /// Calendar dates, present when a start date was configured or supplied.
    pub fn dates(&self) -> Option<&[NaiveDate]> {
        self.dates.as_deref()
    }

    /// Column names: expanded compartments first, then aggregates.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> EpiResult<&[f64]> {
        self.data
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| EpiError::UnknownCompartment(name.to_string()))
    }

    /// Day label at which `column` peaks.
    pub fn peak_day(&self, column: &str) -> EpiResult<i64> {
        let values = self.column(column)?;
        let (i, _) = values
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
                if v > bv {
                    (i, v)
                } else {
                    (bi, bv)
                }
            });
        Ok(self.days[i])
    }

    /// Total population at the first time point.
    pub fn total_population(&self) -> f64 {
        self.columns
            .iter()
            .filter(|c| self.is_base_column(c))
            .filter_map(|c| self.data.get(c))
            .filter_map(|col| col.first())
            .sum()
    }

    // Aggregate-aware population sum: count each person once by preferring
    // the expanded compartments when they exist.
    fn is_base_column(&self, name: &str) -> bool {
        !self
            .columns
            .iter()
            .any(|other| other != name && other.starts_with(name) && other[name.len()..].starts_with('_'))
    }

    /// Sum of every non-aggregate column at time point `i`.
    pub fn population_at(&self, i: usize) -> f64 {
        self.columns
            .iter()
            .filter(|c| self.is_base_column(c))
            .filter_map(|c| self.data.get(c))
            .filter_map(|col| col.get(i))
            .sum()
    }
}

/// Stacked ensemble of trajectories from posterior parameter samples, for
/// prediction intervals.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryEnsemble {
    runs: Vec<Trajectory>,
}

impl TrajectoryEnsemble {
    pub fn new(runs: Vec<Trajectory>) -> Self {
        Self { runs }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn runs(&self) -> &[Trajectory] {
        &self.runs
    }

    fn reduce(
        &self,
        column: &str,
        init: f64,
        f: impl Fn(f64, f64) -> f64,
    ) -> EpiResult<Vec<f64>> {
        let mut out: Option<Vec<f64>> = None;
        for run in &self.runs {
            let col = run.column(column)?;
            let acc = out.get_or_insert_with(|| vec![init; col.len()]);
            for (a, &v) in acc.iter_mut().zip(col) {
                *a = f(*a, v);
            }
        }
        out.ok_or_else(|| EpiError::InvalidInput("empty trajectory ensemble".into()))
    }

    pub fn min(&self, column: &str) -> EpiResult<Vec<f64>> {
        self.reduce(column, f64::INFINITY, f64::min)
    }

    pub fn max(&self, column: &str) -> EpiResult<Vec<f64>> {
        self.reduce(column, f64::NEG_INFINITY, f64::max)
    }

    pub fn mean(&self, column: &str) -> EpiResult<Vec<f64>> {
        let sums = self.reduce(column, 0.0, |a, v| a + v)?;
        let n = self.runs.len() as f64;
        Ok(sums.into_iter().map(|s| s / n).collect())
    }

    /// `(min, mean, max)` envelope per time point for one column.
    pub fn envelope(&self, column: &str) -> EpiResult<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        Ok((self.min(column)?, self.mean(column)?, self.max(column)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_aggregates_sum_expanded_columns() {
        let compartments = strings(&["I_young", "I_old"]);
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let mut traj = Trajectory::from_rows(&compartments, &rows, vec![0, 1]);
        traj.build_aggregates(&[("I".to_string(), strings(&["I_young", "I_old"]))]);
        assert_eq!(traj.column("I").unwrap(), &[3.0, 7.0]);
    }

    #[test]
    fn test_aggregates_skip_existing_plain_column() {
        let compartments = strings(&["S", "I"]);
        let rows = vec![vec![9.0, 1.0]];
        let mut traj = Trajectory::from_rows(&compartments, &rows, vec![0]);
        traj.build_aggregates(&[
            ("S".to_string(), strings(&["S"])),
            ("I".to_string(), strings(&["I"])),
        ]);
        assert_eq!(traj.columns(), &["S", "I"]);
        assert_eq!(traj.column("S").unwrap(), &[9.0]);
    }

    #[test]
    fn test_peak_day_and_population() {
        let compartments = strings(&["S", "I"]);
        let rows = vec![vec![99.0, 1.0], vec![90.0, 10.0], vec![95.0, 5.0]];
        let traj = Trajectory::from_rows(&compartments, &rows, vec![0, 1, 2]);
        assert_eq!(traj.peak_day("I").unwrap(), 1);
        assert_eq!(traj.total_population(), 100.0);
        assert_eq!(traj.population_at(2), 100.0);
    }

    #[test]
    fn test_dates_follow_day_labels() {
        let compartments = strings(&["S"]);
        let rows = vec![vec![1.0], vec![1.0]];
        let mut traj = Trajectory::from_rows(&compartments, &rows, vec![-1, 0]);
        traj.set_dates(NaiveDate::from_ymd_opt(2020, 3, 17).unwrap());
        let dates = traj.dates().unwrap();
        assert_eq!(dates[0], NaiveDate::from_ymd_opt(2020, 3, 16).unwrap());
        assert_eq!(dates[1], NaiveDate::from_ymd_opt(2020, 3, 17).unwrap());
    }

    #[test]
    fn test_interpolate_missing_fills_interior_and_edges() {
        let mut observed = ObservedSeries::from_columns(vec![(
            "I".to_string(),
            vec![f64::NAN, 1.0, f64::NAN, f64::NAN, 4.0, f64::NAN],
        )])
        .unwrap();
        observed.interpolate_missing();
        assert_eq!(observed.column("I").unwrap(), &[1.0, 1.0, 2.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn test_mask_zeros_then_interpolate() {
        let mut observed =
            ObservedSeries::from_columns(vec![("I".to_string(), vec![2.0, 0.0, 4.0])]).unwrap();
        observed.mask_zeros();
        observed.interpolate_missing();
        assert_eq!(observed.column("I").unwrap(), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_ensemble_envelope() {
        let compartments = strings(&["I"]);
        let a = Trajectory::from_rows(&compartments, &[vec![1.0], vec![5.0]], vec![0, 1]);
        let b = Trajectory::from_rows(&compartments, &[vec![3.0], vec![1.0]], vec![0, 1]);
        let ensemble = TrajectoryEnsemble::new(vec![a, b]);
        let (lo, mean, hi) = ensemble.envelope("I").unwrap();
        assert_eq!(lo, vec![1.0, 1.0]);
        assert_eq!(mean, vec![2.0, 3.0]);
        assert_eq!(hi, vec![3.0, 5.0]);
    }

    #[test]
    fn test_ragged_observed_columns_rejected() {
        assert!(ObservedSeries::from_columns(vec![
            ("a".to_string(), vec![1.0]),
            ("b".to_string(), vec![1.0, 2.0]),
        ])
        .is_err());
    }
}
