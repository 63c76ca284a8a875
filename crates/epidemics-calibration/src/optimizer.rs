//! Sequential trial loop around a tree-structured Parzen estimator.

use std::collections::BTreeMap;
use std::time::Instant;

use epidemics_core::{EpidemicModel, ObservedSeries, ParamSet, StateInput, TrajectoryEnsemble};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tpe::density_estimation::DefaultEstimatorBuilder;
use tpe::TpeOptimizer;
use tracing::{debug, info};

use crate::error::{CalResult, CalibrationError};
use crate::metrics::{objective, Constraint, LossBreakdown};
use crate::store::{CalibrationInfo, CalibrationRecord};
use crate::types::{ParamDistribution, ParamRange, RunConfig, SearchSpace, Trial};

enum Sampler {
    /// History-informed sampling over a bounded range.
    Tpe(TpeOptimizer<DefaultEstimatorBuilder>),
    /// Direct draws from a Gaussian prior.
    Normal(Normal<f64>),
}

/// Black-box calibration of a model's free parameters against observed data.
///
/// Each `run` evaluates a fresh study: sample a candidate from the search
/// space, score it through [`objective`], feed the score back to the
/// sampler, and stop on trial budget, stagnation, or timeout. The loop exits
/// normally on every termination condition; the best parameters are reset
/// into the model before returning.
pub struct ParamsOptimizer<'a, M: EpidemicModel> {
    model: &'a mut M,
    trials: Vec<Trial>,
    best: Option<usize>,
    best_loss: Option<LossBreakdown>,
    rng: StdRng,
}

impl<'a, M: EpidemicModel> ParamsOptimizer<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        Self {
            model,
            trials: Vec::new(),
            best: None,
            best_loss: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the sampling seed for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn run(
        &mut self,
        observed: &ObservedSeries,
        space: &SearchSpace,
        init_state: Option<StateInput>,
        config: &RunConfig,
        constraint: Option<&Constraint<M>>,
    ) -> CalResult<Trial> {
        if config.n_jobs != 1 {
            return Err(CalibrationError::ParallelUnsupported(config.n_jobs));
        }
        if space.is_empty() {
            return Err(CalibrationError::EmptySpace);
        }
        self.trials.clear();
        self.best = None;
        self.best_loss = None;

        let mut samplers: BTreeMap<String, Sampler> = BTreeMap::new();
        for (name, range) in space {
            let sampler = match *range {
                ParamRange::Uniform { low, high } => {
                    let range =
                        tpe::range(low, high).map_err(|e| CalibrationError::InvalidRange {
                            name: name.clone(),
                            reason: e.to_string(),
                        })?;
                    Sampler::Tpe(TpeOptimizer::new(tpe::parzen_estimator(), range))
                }
                ParamRange::Normal { mean, std } => Sampler::Normal(
                    Normal::new(mean, std).map_err(|e| CalibrationError::InvalidRange {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?,
                ),
            };
            samplers.insert(name.clone(), sampler);
        }

        let started = Instant::now();
        for number in 0..config.n_trials {
            let mut params = ParamSet::new();
            for (name, sampler) in samplers.iter_mut() {
                let value = match sampler {
                    Sampler::Tpe(optim) => {
                        optim
                            .ask(&mut self.rng)
                            .map_err(|e| CalibrationError::Sampler {
                                name: name.clone(),
                                reason: e.to_string(),
                            })?
                    }
                    Sampler::Normal(dist) => dist.sample(&mut self.rng),
                };
                params.insert(name.clone(), value);
            }

            let loss = objective(self.model, observed, &params, init_state.clone(), constraint)?;
            let value = loss.total;
            for (name, sampler) in samplers.iter_mut() {
                if let Sampler::Tpe(optim) = sampler {
                    optim
                        .tell(params[name], value)
                        .map_err(|e| CalibrationError::Sampler {
                            name: name.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }

            let improved = self
                .best
                .map_or(true, |best| value < self.trials[best].value);
            debug!(number, value, improved, "trial finished");
            self.trials.push(Trial {
                number,
                params,
                value,
            });
            if improved {
                self.best = Some(self.trials.len() - 1);
                self.best_loss = Some(loss);
                info!(number, value, "new best trial");
            }

            // Termination sentinels, checked after every trial so the loop
            // always exits normally.
            if let Some(patience) = config.early_stopping {
                let best_number = self.trials[self.best.unwrap_or(0)].number;
                if number - best_number >= patience {
                    info!(number, best_number, "stopping early, no improvement");
                    break;
                }
            }
            if let Some(timeout) = config.timeout {
                if started.elapsed() >= timeout {
                    info!(number, "stopping, time budget spent");
                    break;
                }
            }
        }

        let best = self
            .best
            .and_then(|i| self.trials.get(i))
            .cloned()
            .ok_or(CalibrationError::NoTrials)?;
        self.model.reset(&best.params)?;
        info!(
            trials = self.trials.len(),
            best = best.value,
            "calibration finished"
        );

        if config.save {
            let record = self.build_record(observed, &init_state, &best, config)?;
            let path = config
                .filename
                .clone()
                .unwrap_or_else(CalibrationRecord::default_filename);
            record.save(&path)?;
            info!(path = %path.display(), "calibration record saved");
        }
        Ok(best)
    }

    fn build_record(
        &self,
        observed: &ObservedSeries,
        init_state: &Option<StateInput>,
        best: &Trial,
        config: &RunConfig,
    ) -> CalResult<CalibrationRecord> {
        let core = self.model.core();
        let mut default_params = core.params().scalar_values();
        for name in best.params.keys() {
            default_params.remove(name);
        }
        let input = init_state
            .clone()
            .unwrap_or(StateInput::Seed(core.seed_count()));
        let init_map = core.make_state(input)?.to_map();
        Ok(CalibrationRecord {
            calibrated_params: best.params.clone(),
            default_params,
            info: CalibrationInfo {
                date: chrono::Utc::now().to_rfc3339(),
                message: config.message.clone(),
                loss: self.best_loss.clone().unwrap_or_default(),
                on: observed.columns().to_vec(),
                init_state: init_map,
            },
        })
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn best_trial(&self) -> CalResult<&Trial> {
        self.best
            .and_then(|i| self.trials.get(i))
            .ok_or(CalibrationError::NoTrials)
    }

    /// Trials whose loss lies strictly below the `q`-quantile of all losses.
    /// Never empty: degenerates to the best trial alone.
    pub fn filtered_trials(&self, q: f64) -> CalResult<Vec<&Trial>> {
        let best = self.best_trial()?;
        let mut values: Vec<f64> = self.trials.iter().map(|t| t.value).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let threshold = quantile(&values, q);
        let filtered: Vec<&Trial> = self
            .trials
            .iter()
            .filter(|t| t.value < threshold)
            .collect();
        if filtered.is_empty() {
            Ok(vec![best])
        } else {
            Ok(filtered)
        }
    }

    /// Per-parameter posterior summary over the `q`-quantile-filtered trials.
    pub fn estimate_params_distributions(
        &self,
        q: f64,
    ) -> CalResult<BTreeMap<String, ParamDistribution>> {
        let best = self.best_trial()?.clone();
        let filtered = self.filtered_trials(q)?;
        let mut out = BTreeMap::new();
        for name in best.params.keys() {
            let mut values: Vec<f64> = filtered
                .iter()
                .filter_map(|t| t.params.get(name).copied())
                .collect();
            values.sort_by(|a, b| a.total_cmp(b));
            let (mean, std) = mean_std(&values);
            out.insert(
                name.clone(),
                ParamDistribution {
                    best: best.params[name],
                    mean,
                    std,
                    p2_5: quantile(&values, 0.025),
                    p97_5: quantile(&values, 0.975),
                },
            );
        }
        Ok(out)
    }

    /// Draw `n` parameter sets from the posterior: per-parameter Gaussian
    /// fits when `norm_fit`, otherwise whole filtered trial records
    /// bootstrapped at random.
    pub fn sample_params(&mut self, n: usize, q: f64, norm_fit: bool) -> CalResult<Vec<ParamSet>> {
        let pool: Vec<ParamSet> = self
            .filtered_trials(q)?
            .into_iter()
            .map(|t| t.params.clone())
            .collect();
        let mut samples = Vec::with_capacity(n);
        if norm_fit {
            let names: Vec<String> = pool[0].keys().cloned().collect();
            let mut fits: Vec<(String, f64, f64)> = Vec::with_capacity(names.len());
            for name in names {
                let values: Vec<f64> = pool
                    .iter()
                    .filter_map(|p| p.get(&name).copied())
                    .collect();
                let (mean, std) = mean_std(&values);
                fits.push((name, mean, std));
            }
            for _ in 0..n {
                let mut set = ParamSet::new();
                for (name, mean, std) in &fits {
                    let value = if *std > 0.0 {
                        let dist = Normal::new(*mean, *std).map_err(|e| {
                            CalibrationError::Sampler {
                                name: name.clone(),
                                reason: e.to_string(),
                            }
                        })?;
                        dist.sample(&mut self.rng)
                    } else {
                        *mean
                    };
                    set.insert(name.clone(), value);
                }
                samples.push(set);
            }
        } else {
            for _ in 0..n {
                let i = self.rng.gen_range(0..pool.len());
                samples.push(pool[i].clone());
            }
        }
        Ok(samples)
    }

    /// Simulate `n` posterior parameter draws and stack the trajectories
    /// into an ensemble for interval computation. The best parameters are
    /// restored into the model afterwards.
    pub fn predict_interval(
        &mut self,
        observed: &ObservedSeries,
        init_state: Option<StateInput>,
        forecast_days: usize,
        n: usize,
        q: f64,
        norm_fit: bool,
    ) -> CalResult<TrajectoryEnsemble> {
        let best_params = self.best_trial()?.params.clone();
        let draws = self.sample_params(n, q, norm_fit)?;
        let mut runs = Vec::with_capacity(draws.len());
        for params in &draws {
            self.model.reset(params)?;
            runs.push(self.model.predict(observed, init_state.clone(), forecast_days)?);
        }
        self.model.reset(&best_params)?;
        Ok(TrajectoryEnsemble::new(runs))
    }
}

/// Linearly interpolated quantile of an already sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] + frac * (sorted[hi] - sorted[lo])
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}
