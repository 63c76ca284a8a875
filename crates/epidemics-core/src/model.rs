//! Model orchestration: declaration, granular expansion, and the solve
//! pipeline around the ODE integrator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use ode_solvers::dopri5::Dopri5;
use ode_solvers::{DVector, System};
use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::contact::{ContactMatrix, ContactStructure};
use crate::error::{EpiError, EpiResult};
use crate::network::CompartmentNetwork;
use crate::params::{Dimensions, ParamTable, ParamValue};
use crate::schedule::Rate;
use crate::series::{ObservedSeries, Trajectory};
use crate::state::{expand_name, State, StateInput, StateLayout};

/// Accepted slack, in persons, between the initial state's sum and the
/// declared total population.
pub const POPULATION_TOLERANCE: f64 = 2.0;

/// Candidate parameter values handed to `reset` during calibration.
pub type ParamSet = BTreeMap<String, f64>;

/// Declarative compartmental model: an ordered set of compartments, an
/// optional dimension expansion, a parameter table, and a transition graph
/// whose derivatives are handed to the integrator.
///
/// Built through [`CompartmentalModel::builder`]; transitions are added
/// afterwards so rate closures can capture resolved parameter values.
pub struct CompartmentalModel {
    layout: Arc<StateLayout>,
    params: ParamTable,
    network: CompartmentNetwork,
    contact: Option<ContactStructure>,
    offset: i64,
    seed_count: f64,
    start_state: Option<String>,
    start_date: Option<NaiveDate>,
    total_population: Option<f64>,
}

impl CompartmentalModel {
    pub fn builder<S: AsRef<str>>(compartments: &[S]) -> ModelBuilder {
        ModelBuilder::new(compartments)
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamTable {
        &mut self.params
    }

    pub fn dimensions(&self) -> &Dimensions {
        self.params.dimensions()
    }

    pub fn network(&self) -> &CompartmentNetwork {
        &self.network
    }

    pub fn contact(&self) -> Option<&ContactStructure> {
        self.contact.as_ref()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Seed count used when `solve` gets no initial state.
    pub fn seed_count(&self) -> f64 {
        self.seed_count
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    /// Total population: explicit override, or the `N` parameter (summed
    /// over the dimension cross product when dimension-valued).
    pub fn n(&self) -> EpiResult<f64> {
        match self.total_population {
            Some(n) => Ok(n),
            None => self.params.total_population(),
        }
    }

    /// Drop every declared transition, keeping compartments and parameters.
    /// Used by `reset` implementations before re-adding rates.
    pub fn clear_transitions(&mut self) {
        self.network = CompartmentNetwork::with_nodes(self.layout.compartments());
    }

    pub fn add_transition(
        &mut self,
        source: &str,
        target: &str,
        rate: impl Into<Rate>,
    ) -> EpiResult<()> {
        for name in [source, target] {
            if !self.layout.contains(name) {
                return Err(EpiError::UnknownCompartment(name.to_string()));
            }
        }
        self.network.add_transition(source, target, rate);
        Ok(())
    }

    pub fn add_transitions(
        &mut self,
        transitions: Vec<(&str, &str, Rate)>,
    ) -> EpiResult<()> {
        for (source, target, rate) in transitions {
            self.add_transition(source, target, rate)?;
        }
        Ok(())
    }

    /// Attach an external flow (births, imports, waning from outside the
    /// graph) directly to one compartment's derivative.
    pub fn add_static_derivative(&mut self, node: &str, rate: impl Into<Rate>) -> EpiResult<()> {
        if !self.layout.contains(node) {
            return Err(EpiError::UnknownCompartment(node.to_string()));
        }
        self.network.add_static_derivative(node, rate);
        Ok(())
    }

    /// Expand one base-level transition across the dimension cross product.
    ///
    /// `factory` is called once per dimension tuple with a scope that
    /// resolves parameters and contact rows for that tuple; the rate it
    /// returns is wired between the tuple's expanded compartments.
    pub fn add_granular_transition<F>(
        &mut self,
        source: &str,
        target: &str,
        factory: F,
    ) -> EpiResult<()>
    where
        F: Fn(&GranularScope<'_>) -> EpiResult<Rate>,
    {
        if self.params.dimensions().is_empty() {
            return Err(EpiError::NoDimensions);
        }
        for base in [source, target] {
            if self.layout.group_indices(base).is_none() {
                return Err(EpiError::UnknownCompartment(base.to_string()));
            }
        }
        let product = self.params.dimensions().product();
        for tuple in &product {
            let scope = GranularScope {
                params: &self.params,
                contact: self.contact.as_ref(),
                tuple,
            };
            let rate = factory(&scope)?;
            self.network
                .add_transition(&expand_name(source, tuple), &expand_name(target, tuple), rate);
        }
        Ok(())
    }

    /// Batch form of [`add_granular_transition`]: one factory call per
    /// dimension tuple produces the rates for every listed transition, so
    /// per-tuple work (contact-row mixing in particular) runs once instead
    /// of once per edge.
    ///
    /// [`add_granular_transition`]: CompartmentalModel::add_granular_transition
    pub fn add_granular_transitions<F>(
        &mut self,
        transitions: &[(&str, &str)],
        factory: F,
    ) -> EpiResult<()>
    where
        F: Fn(&GranularScope<'_>) -> EpiResult<Vec<Rate>>,
    {
        if self.params.dimensions().is_empty() {
            return Err(EpiError::NoDimensions);
        }
        for (source, target) in transitions {
            for base in [source, target] {
                if self.layout.group_indices(base).is_none() {
                    return Err(EpiError::UnknownCompartment(base.to_string()));
                }
            }
        }
        let product = self.params.dimensions().product();
        for tuple in &product {
            let scope = GranularScope {
                params: &self.params,
                contact: self.contact.as_ref(),
                tuple,
            };
            let rates = factory(&scope)?;
            if rates.len() != transitions.len() {
                return Err(EpiError::InvalidInput(format!(
                    "granular factory returned {} rates for {} transitions",
                    rates.len(),
                    transitions.len()
                )));
            }
            for ((source, target), rate) in transitions.iter().zip(rates) {
                self.network.add_transition(
                    &expand_name(source, tuple),
                    &expand_name(target, tuple),
                    rate,
                );
            }
        }
        Ok(())
    }

    /// Normalize any accepted input into a full state vector.
    ///
    /// A seed count places `N − seed` in the zeroth compartment and `seed`
    /// in the configured start state (or the second compartment).
    pub fn make_state(&self, input: impl Into<StateInput>) -> EpiResult<State> {
        match input.into() {
            StateInput::Values(values) => State::new(self.layout.clone(), values),
            StateInput::Map(map) => {
                let mut values = vec![0.0; self.layout.len()];
                for (name, value) in map {
                    let i = self
                        .layout
                        .position(&name)
                        .ok_or(EpiError::UnknownCompartment(name))?;
                    values[i] = value;
                }
                State::new(self.layout.clone(), values)
            }
            StateInput::Seed(seed) => {
                let n = self.n()?;
                let mut values = vec![0.0; self.layout.len()];
                let start = match &self.start_state {
                    Some(name) => self
                        .layout
                        .position(name)
                        .or_else(|| {
                            self.layout
                                .group_indices(name)
                                .and_then(|g| g.first().copied())
                        })
                        .ok_or_else(|| EpiError::UnknownCompartment(name.clone()))?,
                    None => {
                        if self.layout.len() < 2 {
                            return Err(EpiError::InvalidInput(
                                "a seed count needs at least two compartments".into(),
                            ));
                        }
                        1
                    }
                };
                values[0] = n - seed;
                values[start] += seed;
                State::new(self.layout.clone(), values)
            }
        }
    }

    /// Place the total population in `state_name`, then move seed counts
    /// into the named seed compartments.
    ///
    /// With dimensions, the population lands per tuple (per-dimension `N`,
    /// or a scalar `N` spread uniformly) and each seed name must be a fully
    /// expanded compartment so the matching tuple can be debited.
    pub fn make_init_state(&self, state_name: &str, seeds: &[(&str, f64)]) -> EpiResult<State> {
        let mut values = vec![0.0; self.layout.len()];
        let dims = self.params.dimensions();

        if dims.is_empty() {
            let home = self
                .layout
                .position(state_name)
                .ok_or_else(|| EpiError::UnknownCompartment(state_name.to_string()))?;
            values[home] = self.n()?;
            for (name, count) in seeds {
                let i = self
                    .layout
                    .position(name)
                    .ok_or_else(|| EpiError::InvalidSeed(name.to_string()))?;
                values[i] += count;
                values[home] -= count;
            }
        } else {
            let indices = self
                .layout
                .group_indices(state_name)
                .ok_or_else(|| EpiError::UnknownCompartment(state_name.to_string()))?
                .to_vec();
            let product = dims.product();
            let uniform = if self.params.is_scalar("N") || !self.params.contains("N") {
                Some(self.n()? / product.len() as f64)
            } else {
                None
            };
            for (slot, tuple) in indices.iter().zip(&product) {
                values[*slot] = match uniform {
                    Some(share) => share,
                    None => self.params.get("N", tuple)?,
                };
            }
            for (name, count) in seeds {
                let i = self
                    .layout
                    .position(name)
                    .ok_or_else(|| EpiError::InvalidSeed(name.to_string()))?;
                // Debit the population compartment of the same tuple.
                let suffix = name
                    .split_once('_')
                    .map(|(_, rest)| rest)
                    .ok_or_else(|| EpiError::InvalidSeed(name.to_string()))?;
                let home = self
                    .layout
                    .position(&format!("{state_name}_{suffix}"))
                    .ok_or_else(|| EpiError::InvalidSeed(name.to_string()))?;
                values[i] += count;
                values[home] -= count;
            }
        }
        State::new(self.layout.clone(), values)
    }

    /// Integrate the model over `n_days` days and return the labeled,
    /// aggregated trajectory.
    pub fn solve(
        &self,
        n_days: usize,
        init_state: Option<StateInput>,
        start_date: Option<NaiveDate>,
    ) -> EpiResult<Trajectory> {
        if n_days == 0 {
            return Err(EpiError::InvalidInput(
                "horizon must cover at least one day".into(),
            ));
        }
        if self.offset > 0 && (n_days as i64) <= self.offset {
            return Err(EpiError::HorizonTooShort {
                n_days,
                offset: self.offset,
            });
        }

        let input = init_state.unwrap_or(StateInput::Seed(self.seed_count));
        let state = self.make_state(input)?;
        let expected = self.n()?;
        let got = state.sum();
        if (got - expected).abs() > POPULATION_TOLERANCE {
            return Err(EpiError::PopulationMismatch { expected, got });
        }

        let t_end = (n_days as i64 - self.offset) as f64;
        debug!(n_days, offset = self.offset, t_end, "integrating model");

        let order: Vec<NodeIndex> = self
            .layout
            .compartments()
            .iter()
            .map(|name| {
                self.network
                    .node_index(name)
                    .ok_or_else(|| EpiError::UnknownCompartment(name.clone()))
            })
            .collect::<EpiResult<_>>()?;
        let system = OdeSystem {
            network: &self.network,
            layout: self.layout.clone(),
            order,
        };
        let y0 = DVector::from_vec(state.values().to_vec());
        let mut stepper = Dopri5::new(system, 0.0, t_end, 1.0, y0, 1e-8, 1e-8);
        stepper
            .integrate()
            .map_err(|e| EpiError::Integration(e.to_string()))?;

        let times = stepper.x_out().clone();
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(times.len());
        for (t, y) in times.iter().zip(stepper.y_out()) {
            for (j, v) in y.iter().enumerate() {
                if !v.is_finite() {
                    return Err(EpiError::NonFiniteDerivative {
                        compartment: self.layout.compartments()[j].clone(),
                        t: *t,
                    });
                }
            }
            rows.push(y.iter().copied().collect());
        }

        // A positive offset back-fills the first computed row; a negative
        // one shifts the day labels instead of the values.
        let days: Vec<i64> = if self.offset > 0 {
            let first = rows[0].clone();
            for _ in 0..self.offset {
                rows.insert(0, first.clone());
            }
            (0..=n_days as i64).collect()
        } else {
            (self.offset..=n_days as i64).collect()
        };

        let mut trajectory = Trajectory::from_rows(self.layout.compartments(), &rows, days);
        let groups: Vec<(String, Vec<String>)> = self
            .layout
            .bases()
            .iter()
            .map(|base| {
                let members = self
                    .layout
                    .group_indices(base)
                    .unwrap_or(&[])
                    .iter()
                    .map(|&i| self.layout.compartments()[i].clone())
                    .collect();
                (base.clone(), members)
            })
            .collect();
        trajectory.build_aggregates(&groups);

        if let Some(start) = start_date.or(self.start_date) {
            trajectory.set_dates(start);
        }
        Ok(trajectory)
    }
}

/// Per-tuple view handed to granular rate factories: resolves parameters,
/// compartment names, and contact rows for one dimension tuple.
pub struct GranularScope<'a> {
    params: &'a ParamTable,
    contact: Option<&'a ContactStructure>,
    tuple: &'a [String],
}

impl GranularScope<'_> {
    pub fn tuple(&self) -> &[String] {
        self.tuple
    }

    /// Category of this tuple on the named dimension level.
    pub fn category(&self, level: &str) -> EpiResult<&str> {
        let idx = self
            .params
            .dimensions()
            .level_index(level)
            .ok_or_else(|| EpiError::UnknownDimension(level.to_string()))?;
        Ok(self.tuple[idx].as_str())
    }

    /// Scalar value of a parameter for this tuple.
    pub fn param(&self, name: &str) -> EpiResult<f64> {
        self.params.get(name, self.tuple)
    }

    /// Expanded compartment name for a base state in this tuple.
    pub fn compartment(&self, base: &str) -> String {
        expand_name(base, self.tuple)
    }

    /// This tuple's row of the combined contact matrix, in dimension-product
    /// order (the same order as [`State::group`]).
    pub fn contact_row(&self) -> EpiResult<Vec<f64>> {
        self.contact
            .ok_or_else(|| {
                EpiError::InvalidInput("no contact matrices configured for this model".into())
            })?
            .row(self.tuple)
    }
}

struct OdeSystem<'a> {
    network: &'a CompartmentNetwork,
    layout: Arc<StateLayout>,
    order: Vec<NodeIndex>,
}

impl System<f64, DVector<f64>> for OdeSystem<'_> {
    fn system(&self, t: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        // Lengths are fixed at construction, so this cannot fail mid-run.
        let Ok(state) = State::new(self.layout.clone(), y.iter().copied().collect()) else {
            return;
        };
        for (i, idx) in self.order.iter().enumerate() {
            dy[i] = self.network.node_derivative(*idx, &state, t);
        }
    }
}

/// Builder for [`CompartmentalModel`]. Compartment names are fixed up front;
/// everything else is optional.
pub struct ModelBuilder {
    bases: Vec<String>,
    dims: Dimensions,
    params: Vec<(String, ParamValue)>,
    per_category: Vec<(String, String, Vec<(String, f64)>)>,
    contact: HashMap<String, ContactMatrix>,
    offset: i64,
    seed_count: f64,
    start_state: Option<String>,
    start_date: Option<NaiveDate>,
    total_population: Option<f64>,
}

impl ModelBuilder {
    fn new<S: AsRef<str>>(compartments: &[S]) -> Self {
        Self {
            bases: compartments.iter().map(|s| s.as_ref().to_string()).collect(),
            dims: Dimensions::new(),
            params: Vec::new(),
            per_category: Vec::new(),
            contact: HashMap::new(),
            offset: 0,
            seed_count: 1.0,
            start_state: None,
            start_date: None,
            total_population: None,
        }
    }

    pub fn with_dimensions(mut self, dims: Dimensions) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_param_per_category(
        mut self,
        name: impl Into<String>,
        level: impl Into<String>,
        values: &[(&str, f64)],
    ) -> Self {
        self.per_category.push((
            name.into(),
            level.into(),
            values.iter().map(|(c, v)| (c.to_string(), *v)).collect(),
        ));
        self
    }

    pub fn with_contact_matrix(mut self, level: impl Into<String>, matrix: ContactMatrix) -> Self {
        self.contact.insert(level.into(), matrix);
        self
    }

    /// Days of initial transient held before the reporting window; negative
    /// values shift the day labels backwards instead.
    pub fn with_offset(mut self, days: i64) -> Self {
        self.offset = days;
        self
    }

    /// Default seed count used when `solve` gets no initial state.
    pub fn with_seed(mut self, count: f64) -> Self {
        self.seed_count = count;
        self
    }

    /// Compartment that receives the seed count.
    pub fn with_start_state(mut self, name: impl Into<String>) -> Self {
        self.start_state = Some(name.into());
        self
    }

    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    /// Explicit total population, overriding the `N` parameter.
    pub fn with_total_population(mut self, n: f64) -> Self {
        self.total_population = Some(n);
        self
    }

    pub fn build(self) -> EpiResult<CompartmentalModel> {
        if self.bases.is_empty() {
            return Err(EpiError::InvalidInput(
                "a model needs at least one compartment".into(),
            ));
        }
        let layout = Arc::new(StateLayout::new(&self.bases, &self.dims));

        let mut params = ParamTable::new(self.dims.clone());
        for (name, value) in self.params {
            params.insert(name, value);
        }
        for (name, level, values) in self.per_category {
            let borrowed: Vec<(&str, f64)> =
                values.iter().map(|(c, v)| (c.as_str(), *v)).collect();
            params.insert_per_category(name, &level, &borrowed)?;
        }

        let contact = if self.contact.is_empty() && self.dims.is_empty() {
            None
        } else if self.dims.is_empty() {
            // Matrices without dimensions: report the stray level.
            return Err(EpiError::UnknownDimension(
                self.contact.keys().next().cloned().unwrap_or_default(),
            ));
        } else {
            Some(ContactStructure::build(&self.dims, self.contact)?)
        };

        if let Some(name) = &self.start_state {
            if !layout.contains(name) && layout.group_indices(name).is_none() {
                return Err(EpiError::UnknownCompartment(name.clone()));
            }
        }

        let network = CompartmentNetwork::with_nodes(layout.compartments());
        Ok(CompartmentalModel {
            layout,
            params,
            network,
            contact,
            offset: self.offset,
            seed_count: self.seed_count,
            start_state: self.start_state,
            start_date: self.start_date,
            total_population: self.total_population,
        })
    }
}

/// Contract between a concrete model and the calibration layer.
///
/// `reset` and `r0` default to errors so a plain forward model works without
/// them; calibration requires `reset`, and constraints on the reproduction
/// number require `r0`.
pub trait EpidemicModel {
    fn core(&self) -> &CompartmentalModel;

    fn core_mut(&mut self) -> &mut CompartmentalModel;

    /// Rebuild the transition graph from candidate parameter values.
    fn reset(&mut self, _params: &ParamSet) -> EpiResult<()> {
        Err(EpiError::Unimplemented("reset"))
    }

    /// Basic reproduction number under the current parameters.
    fn r0(&self) -> EpiResult<f64> {
        Err(EpiError::Unimplemented("r0"))
    }

    fn solve(
        &self,
        n_days: usize,
        init_state: Option<StateInput>,
        start_date: Option<NaiveDate>,
    ) -> EpiResult<Trajectory> {
        self.core().solve(n_days, init_state, start_date)
    }

    /// Simulate over the observed span plus `forecast_days`, aligned to the
    /// observed start date.
    fn predict(
        &self,
        observed: &ObservedSeries,
        init_state: Option<StateInput>,
        forecast_days: usize,
    ) -> EpiResult<Trajectory> {
        if observed.is_empty() {
            return Err(EpiError::InvalidInput(
                "cannot predict against an empty observed series".into(),
            ));
        }
        let n_days = observed.len() - 1 + forecast_days;
        let start = observed.start_date().or(self.core().start_date);
        self.core().solve(n_days, init_state, start)
    }
}

impl EpidemicModel for CompartmentalModel {
    fn core(&self) -> &CompartmentalModel {
        self
    }

    fn core_mut(&mut self) -> &mut CompartmentalModel {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sir() -> CompartmentalModel {
        CompartmentalModel::builder(&["S", "I", "R"])
            .with_param("N", 1000.0)
            .with_start_state("I")
            .build()
            .unwrap()
    }

    #[test]
    fn test_seed_input_places_counts() {
        let model = sir();
        let state = model.make_state(5.0).unwrap();
        assert_eq!(state.get("S"), 995.0);
        assert_eq!(state.get("I"), 5.0);
        assert_eq!(state.get("R"), 0.0);
    }

    #[test]
    fn test_map_input_zero_fills() {
        let model = sir();
        let mut map = BTreeMap::new();
        map.insert("S".to_string(), 990.0);
        map.insert("I".to_string(), 10.0);
        let state = model.make_state(map).unwrap();
        assert_eq!(state.get("R"), 0.0);
        assert_eq!(state.sum(), 1000.0);
    }

    #[test]
    fn test_map_input_rejects_unknown_compartment() {
        let model = sir();
        let mut map = BTreeMap::new();
        map.insert("X".to_string(), 1.0);
        assert!(matches!(
            model.make_state(map).unwrap_err(),
            EpiError::UnknownCompartment(name) if name == "X"
        ));
    }

    #[test]
    fn test_transition_rejects_unknown_compartment() {
        let mut model = sir();
        let err = model.add_transition("S", "X", 0.1).unwrap_err();
        assert!(matches!(err, EpiError::UnknownCompartment(name) if name == "X"));
    }

    #[test]
    fn test_granular_requires_dimensions() {
        let mut model = sir();
        let err = model
            .add_granular_transition("S", "I", |_| Ok(Rate::constant(0.1)))
            .unwrap_err();
        assert!(matches!(err, EpiError::NoDimensions));
    }

    #[test]
    fn test_make_init_state_granular_per_category() {
        let dims = Dimensions::new().with_level("age", &["young", "old"]);
        let model = CompartmentalModel::builder(&["S", "I"])
            .with_dimensions(dims)
            .with_param_per_category("N", "age", &[("young", 600.0), ("old", 400.0)])
            .build()
            .unwrap();
        let state = model.make_init_state("S", &[("I_old", 3.0)]).unwrap();
        assert_eq!(state.get("S_young"), 600.0);
        assert_eq!(state.get("S_old"), 397.0);
        assert_eq!(state.get("I_old"), 3.0);
        assert_eq!(state.sum(), 1000.0);
    }

    #[test]
    fn test_make_init_state_granular_uniform_split() {
        let dims = Dimensions::new().with_level("age", &["young", "old"]);
        let model = CompartmentalModel::builder(&["S", "I"])
            .with_dimensions(dims)
            .with_param("N", 1000.0)
            .build()
            .unwrap();
        let state = model.make_init_state("S", &[]).unwrap();
        assert_eq!(state.get("S_young"), 500.0);
        assert_eq!(state.get("S_old"), 500.0);
    }

    #[test]
    fn test_make_init_state_rejects_base_seed_with_dimensions() {
        let dims = Dimensions::new().with_level("age", &["young", "old"]);
        let model = CompartmentalModel::builder(&["S", "I"])
            .with_dimensions(dims)
            .with_param("N", 1000.0)
            .build()
            .unwrap();
        let err = model.make_init_state("S", &[("I", 1.0)]).unwrap_err();
        assert!(matches!(err, EpiError::InvalidSeed(name) if name == "I"));
    }

    #[test]
    fn test_horizon_must_exceed_offset() {
        let model = CompartmentalModel::builder(&["S", "I"])
            .with_param("N", 100.0)
            .with_offset(10)
            .build()
            .unwrap();
        let err = model.solve(10, None, None).unwrap_err();
        assert!(matches!(
            err,
            EpiError::HorizonTooShort { n_days: 10, offset: 10 }
        ));
    }

    #[test]
    fn test_population_mismatch_is_fatal() {
        let model = sir();
        let err = model
            .solve(5, Some(vec![1.0, 1.0, 1.0].into()), None)
            .unwrap_err();
        assert!(matches!(err, EpiError::PopulationMismatch { .. }));
    }

    /// SIR with SI mass action, used by the solve scenarios.
    struct TestSir {
        core: CompartmentalModel,
        beta: f64,
        gamma: f64,
    }

    impl TestSir {
        const N: f64 = 1000.0;

        fn new(beta: f64, gamma: f64) -> EpiResult<Self> {
            let core = CompartmentalModel::builder(&["S", "I", "R"])
                .with_param("N", Self::N)
                .with_start_state("I")
                .build()?;
            let mut model = Self { core, beta, gamma };
            model.wire()?;
            Ok(model)
        }

        fn wire(&mut self) -> EpiResult<()> {
            self.core.clear_transitions();
            let (beta, gamma) = (self.beta, self.gamma);
            self.core.add_transition(
                "S",
                "I",
                Rate::func(move |y, _| beta * y.get("S") * y.get("I") / Self::N),
            )?;
            self.core
                .add_transition("I", "R", Rate::func(move |y, _| gamma * y.get("I")))
        }
    }

    impl EpidemicModel for TestSir {
        fn core(&self) -> &CompartmentalModel {
            &self.core
        }

        fn core_mut(&mut self) -> &mut CompartmentalModel {
            &mut self.core
        }

        fn reset(&mut self, params: &ParamSet) -> EpiResult<()> {
            if let Some(beta) = params.get("beta") {
                self.beta = *beta;
            }
            if let Some(gamma) = params.get("gamma") {
                self.gamma = *gamma;
            }
            self.wire()
        }

        fn r0(&self) -> EpiResult<f64> {
            Ok(self.beta / self.gamma)
        }
    }

    #[test]
    fn test_two_compartment_decay() {
        let mut model = CompartmentalModel::builder(&["S", "I"])
            .with_param("N", 100.0)
            .build()
            .unwrap();
        let rate = 0.3;
        model
            .add_transition("S", "I", Rate::func(move |y, _| rate * y.get("S")))
            .unwrap();
        let traj = model
            .solve(20, Some(vec![100.0, 0.0].into()), None)
            .unwrap();

        let s = traj.column("S").unwrap();
        let i = traj.column("I").unwrap();
        assert_eq!(i[0], 0.0);
        for w in s.windows(2) {
            assert!(w[1] <= w[0]);
        }
        for w in i.windows(2) {
            assert!(w[1] >= w[0]);
        }
        // Analytic solution and conservation at every point.
        for (t, (&sv, &iv)) in s.iter().zip(i).enumerate() {
            assert!((sv - 100.0 * (-rate * t as f64).exp()).abs() < 1e-5);
            assert!((sv + iv - 100.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sir_epidemic_dynamics() {
        let model = TestSir::new(2.0, 1.0).unwrap();
        assert_eq!(model.r0().unwrap(), 2.0);

        let mut init = BTreeMap::new();
        init.insert("S".to_string(), 999.0);
        init.insert("I".to_string(), 1.0);
        let traj = model.solve(100, Some(init.into()), None).unwrap();

        let peak = traj.peak_day("I").unwrap();
        assert!(peak > 0 && peak < 100, "interior peak, got day {peak}");
        let i = traj.column("I").unwrap();
        assert!(*i.last().unwrap() < 1.0, "epidemic dies out");
        for name in ["S", "I", "R"] {
            for &v in traj.column(name).unwrap() {
                assert!(v >= -1e-6, "{name} stayed non-negative");
            }
        }
        for t in 0..traj.len() {
            assert!((traj.population_at(t) - 1000.0).abs() < 1e-6 * 1000.0);
        }
    }

    #[test]
    fn test_single_category_granular_matches_plain() {
        let plain = TestSir::new(1.5, 0.5).unwrap();
        let mut init = BTreeMap::new();
        init.insert("S".to_string(), 999.0);
        init.insert("I".to_string(), 1.0);
        let expected = plain.solve(50, Some(init.into()), None).unwrap();

        let dims = Dimensions::new().with_level("age", &["all"]);
        let mut granular = CompartmentalModel::builder(&["S", "I", "R"])
            .with_dimensions(dims)
            .with_param("N", 1000.0)
            .with_param("beta", 1.5)
            .with_param("gamma", 0.5)
            .build()
            .unwrap();
        granular
            .add_granular_transition("S", "I", |scope| {
                let s = scope.compartment("S");
                let beta = scope.param("beta")?;
                let n = scope.param("N")?;
                let row = scope.contact_row()?;
                Ok(Rate::func(move |y, _| {
                    let infectious: f64 = y
                        .group("I")
                        .iter()
                        .zip(&row)
                        .map(|(v, c)| c * v)
                        .sum();
                    beta * y.get(&s) * infectious / n
                }))
            })
            .unwrap();
        granular
            .add_granular_transition("I", "R", |scope| {
                let i = scope.compartment("I");
                let gamma = scope.param("gamma")?;
                Ok(Rate::func(move |y, _| gamma * y.get(&i)))
            })
            .unwrap();

        let init = granular.make_init_state("S", &[("I_all", 1.0)]).unwrap();
        let got = granular
            .solve(50, Some(init.values().into()), None)
            .unwrap();

        for name in ["S", "I", "R"] {
            let a = expected.column(name).unwrap();
            let b = got.column(name).unwrap();
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-6, "{name}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn test_batch_granular_with_contact_mixing() {
        let dims = Dimensions::new().with_level("age", &["young", "old"]);
        let contact = ContactMatrix::new(
            vec!["young".to_string(), "old".to_string()],
            vec![vec![0.8, 0.2], vec![0.2, 0.6]],
        )
        .unwrap();
        let mut model = CompartmentalModel::builder(&["S", "I", "R"])
            .with_dimensions(dims)
            .with_param_per_category("N", "age", &[("young", 600.0), ("old", 400.0)])
            .with_param("beta", 1.2)
            .with_param("gamma", 0.4)
            .with_contact_matrix("age", contact)
            .build()
            .unwrap();

        model
            .add_granular_transitions(&[("S", "I"), ("I", "R")], |scope| {
                let s = scope.compartment("S");
                let i = scope.compartment("I");
                let beta = scope.param("beta")?;
                let gamma = scope.param("gamma")?;
                let n = scope.param("N")?;
                let row = scope.contact_row()?;
                let infection = Rate::func(move |y, _| {
                    let mix: f64 = y.group("I").iter().zip(&row).map(|(v, c)| c * v).sum();
                    beta * y.get(&s) * mix / n
                });
                let recovery = Rate::func(move |y, _| gamma * y.get(&i));
                Ok(vec![infection, recovery])
            })
            .unwrap();

        let init = model.make_init_state("S", &[("I_young", 1.0)]).unwrap();
        let traj = model.solve(40, Some(init.values().into()), None).unwrap();
        for t in 0..traj.len() {
            assert!((traj.population_at(t) - 1000.0).abs() < 1e-6 * 1000.0);
        }
        // Cross-group mixing carries the infection into the old group.
        assert!(*traj.column("R_old").unwrap().last().unwrap() > 0.0);

        let err = model
            .add_granular_transitions(&[("S", "I")], |_| Ok(vec![]))
            .unwrap_err();
        assert!(matches!(err, EpiError::InvalidInput(_)));
    }

    #[test]
    fn test_positive_offset_backfills_first_value() {
        let mut model = CompartmentalModel::builder(&["S", "I"])
            .with_param("N", 100.0)
            .with_offset(5)
            .build()
            .unwrap();
        model
            .add_transition("S", "I", Rate::func(|y, _| 0.2 * y.get("S")))
            .unwrap();
        let traj = model
            .solve(10, Some(vec![100.0, 0.0].into()), None)
            .unwrap();

        assert_eq!(traj.len(), 11);
        assert_eq!(traj.days(), (0..=10).collect::<Vec<i64>>());
        let s = traj.column("S").unwrap();
        // The padded region mirrors the earliest computed value.
        for t in 0..=5 {
            assert_eq!(s[t], 100.0);
        }
        assert!(s[6] < 100.0);
    }

    #[test]
    fn test_negative_offset_shifts_labels() {
        let model = CompartmentalModel::builder(&["S", "I"])
            .with_param("N", 100.0)
            .with_offset(-3)
            .build()
            .unwrap();
        let traj = model
            .solve(5, Some(vec![100.0, 0.0].into()), None)
            .unwrap();
        assert_eq!(traj.days(), ((-3)..=5).collect::<Vec<i64>>());
        assert_eq!(traj.len(), 9);
    }

    #[test]
    fn test_zero_offset_is_identity() {
        let build = |offset: i64| {
            let mut model = CompartmentalModel::builder(&["S", "I"])
                .with_param("N", 100.0)
                .with_offset(offset)
                .build()
                .unwrap();
            model
                .add_transition("S", "I", Rate::func(|y, _| 0.1 * y.get("S")))
                .unwrap();
            model.solve(10, Some(vec![100.0, 0.0].into()), None).unwrap()
        };
        let a = build(0);
        let b = build(0);
        assert_eq!(a.days(), b.days());
        for name in ["S", "I"] {
            assert_eq!(a.column(name).unwrap(), b.column(name).unwrap());
        }
    }

    #[test]
    fn test_predict_aligns_to_observed_start() {
        use chrono::NaiveDate;

        let model = TestSir::new(2.0, 1.0).unwrap();
        let start = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        let observed = ObservedSeries::from_columns(vec![("I".to_string(), vec![1.0; 11])])
            .unwrap()
            .with_start_date(start);

        let traj = model.predict(&observed, Some(StateInput::Seed(1.0)), 5).unwrap();
        assert_eq!(traj.len(), 16);
        let dates = traj.dates().unwrap();
        assert_eq!(dates[0], start);
        assert_eq!(
            *dates.last().unwrap(),
            NaiveDate::from_ymd_opt(2020, 3, 16).unwrap()
        );
    }

    #[test]
    fn test_unimplemented_defaults() {
        let mut model = sir();
        assert!(matches!(
            model.r0().unwrap_err(),
            EpiError::Unimplemented("r0")
        ));
        assert!(matches!(
            model.reset(&ParamSet::new()).unwrap_err(),
            EpiError::Unimplemented("reset")
        ));
    }
}
