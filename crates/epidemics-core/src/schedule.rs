//! Transition rates and time-varying parameter schedules.
//!
//! A rate is decided once, at model-construction time, as one of four tagged
//! cases: a constant, a stepwise date/value schedule, a smooth sigmoid
//! schedule, or an opaque function of `(state, t)`. Evaluation never
//! re-inspects what kind of value it is dealing with beyond this tag.

use std::fmt;
use std::sync::Arc;

use crate::error::{EpiError, EpiResult};
use crate::state::State;

/// Fraction of a jump traversed within `duration` days, unless overridden.
pub const DEFAULT_INTERVAL: f64 = 0.95;

/// Default number of days to traverse one scheduled jump.
pub const DEFAULT_TRANSITION_DAYS: f64 = 4.0;

/// A transition rate: flow in persons per time unit, always scalar.
#[derive(Clone)]
pub enum Rate {
    Constant(f64),
    Stepwise(TimeIndexedSchedule),
    Sigmoid(SigmoidSchedule),
    Func(Arc<dyn Fn(&State, f64) -> f64 + Send + Sync>),
}

impl Rate {
    pub fn constant(value: f64) -> Self {
        Rate::Constant(value)
    }

    pub fn func(f: impl Fn(&State, f64) -> f64 + Send + Sync + 'static) -> Self {
        Rate::Func(Arc::new(f))
    }

    /// Evaluate the rate at state `y` and time `t`.
    pub fn eval(&self, y: &State, t: f64) -> f64 {
        match self {
            Rate::Constant(v) => *v,
            Rate::Stepwise(s) => s.value(t),
            Rate::Sigmoid(s) => s.value(t),
            Rate::Func(f) => f(y, t),
        }
    }
}

impl fmt::Debug for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Constant(v) => write!(f, "Rate::Constant({v})"),
            Rate::Stepwise(s) => write!(f, "Rate::Stepwise({s:?})"),
            Rate::Sigmoid(s) => write!(f, "Rate::Sigmoid({s:?})"),
            Rate::Func(_) => write!(f, "Rate::Func(..)"),
        }
    }
}

impl From<f64> for Rate {
    fn from(value: f64) -> Self {
        Rate::Constant(value)
    }
}

impl From<TimeIndexedSchedule> for Rate {
    fn from(s: TimeIndexedSchedule) -> Self {
        Rate::Stepwise(s)
    }
}

impl From<SigmoidSchedule> for Rate {
    fn from(s: SigmoidSchedule) -> Self {
        Rate::Sigmoid(s)
    }
}

/// Explicit date/value mapping with no interpolation: the value at `t` is the
/// most recent point whose date is ≤ `t`, and the first value before that.
#[derive(Debug, Clone)]
pub struct TimeIndexedSchedule {
    dates: Vec<f64>,
    values: Vec<f64>,
}

impl TimeIndexedSchedule {
    pub fn new(points: Vec<(f64, f64)>) -> EpiResult<Self> {
        if points.is_empty() {
            return Err(EpiError::InvalidInput(
                "time-indexed schedule needs at least one (date, value) point".into(),
            ));
        }
        if points.windows(2).any(|w| w[1].0 <= w[0].0) {
            return Err(EpiError::InvalidInput(
                "time-indexed schedule dates must be strictly increasing".into(),
            ));
        }
        let (dates, values) = points.into_iter().unzip();
        Ok(Self { dates, values })
    }

    pub fn value(&self, t: f64) -> f64 {
        match self.dates.iter().rposition(|&d| d <= t) {
            Some(i) => self.values[i],
            None => self.values[0],
        }
    }
}

/// Logistic ramp from `start` to `end` beginning at `start_date`.
///
/// Parameterized by the time to traverse a fraction `interval` of the full
/// jump rather than a raw rate constant, so `duration` reads as
/// "days to transition": `k = 2/duration · ln(interval / (1 − interval))`,
/// with the inflection at `start_date + duration/2`.
pub fn sigmoid_response(
    t: f64,
    start_date: f64,
    start: f64,
    end: f64,
    duration: f64,
    interval: f64,
) -> f64 {
    let k = 2.0 / duration * (interval / (1.0 - interval)).ln();
    let inflection = start_date + duration / 2.0;
    (start - end) / (1.0 + (-k * (-t + inflection)).exp()) + end
}

/// Piecewise schedule of target values reached through sigmoid ramps.
///
/// Jumps compose additively: each subsequent ramp starts from the previous
/// target rather than recomputing from the baseline, so overlapping
/// transitions blend instead of snapping back. A non-smoothed mode steps
/// discontinuously at each date instead.
#[derive(Debug, Clone)]
pub struct SigmoidSchedule {
    baseline: f64,
    targets: Vec<f64>,
    dates: Vec<f64>,
    durations: Vec<f64>,
    interval: f64,
    smooth: bool,
}

impl SigmoidSchedule {
    pub fn new(baseline: f64, targets: Vec<f64>, dates: Vec<f64>) -> EpiResult<Self> {
        if targets.is_empty() || targets.len() != dates.len() {
            return Err(EpiError::InvalidInput(format!(
                "sigmoid schedule needs matching non-empty targets and dates, got {} targets and {} dates",
                targets.len(),
                dates.len()
            )));
        }
        let durations = vec![DEFAULT_TRANSITION_DAYS; targets.len()];
        Ok(Self {
            baseline,
            targets,
            dates,
            durations,
            interval: DEFAULT_INTERVAL,
            smooth: true,
        })
    }

    /// Same transition duration (in days) for every jump.
    pub fn with_duration(mut self, days: f64) -> Self {
        self.durations = vec![days; self.targets.len()];
        self
    }

    /// Per-jump transition durations; the length must match the targets.
    pub fn with_durations(mut self, days: Vec<f64>) -> EpiResult<Self> {
        if days.len() != self.targets.len() {
            return Err(EpiError::InvalidInput(format!(
                "expected {} durations, got {}",
                self.targets.len(),
                days.len()
            )));
        }
        self.durations = days;
        Ok(self)
    }

    /// Fraction of the jump traversed within each duration (default 0.95).
    pub fn with_interval(mut self, interval: f64) -> Self {
        self.interval = interval;
        self
    }

    /// Step discontinuously at each date instead of ramping.
    pub fn stepped(mut self) -> Self {
        self.smooth = false;
        self
    }

    pub fn value(&self, t: f64) -> f64 {
        if !self.smooth {
            return match self.dates.iter().rposition(|&d| d <= t) {
                Some(i) => self.targets[i],
                None => self.baseline,
            };
        }

        let mut yt = sigmoid_response(
            t,
            self.dates[0],
            self.baseline,
            self.targets[0],
            self.durations[0],
            self.interval,
        );
        for i in 1..self.targets.len() {
            yt += sigmoid_response(
                t,
                self.dates[i],
                0.0,
                self.targets[i] - self.targets[i - 1],
                self.durations[i],
                self.interval,
            );
        }
        yt
    }
}
