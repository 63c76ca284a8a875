//! Declarative compartmental epidemic models.
//!
//! A model is an ordered set of compartments, optional categorical
//! dimensions (age bands, regions, …), a parameter table, and a directed
//! transition graph whose edge rates define the ODE right-hand side. The
//! engine expands granular transitions across the dimension cross product,
//! drives an external Runge-Kutta integrator, and post-processes the raw
//! trajectory into labeled, aggregated, date-indexed output.
//!
//! ```no_run
//! use epidemics_core::{CompartmentalModel, Rate};
//!
//! # fn main() -> epidemics_core::EpiResult<()> {
//! let mut model = CompartmentalModel::builder(&["S", "I", "R"])
//!     .with_param("N", 1000.0)
//!     .with_start_state("I")
//!     .build()?;
//! model.add_transition("S", "I", Rate::func(|y, _t| 0.5 * y.get("S") * y.get("I") / 1000.0))?;
//! model.add_transition("I", "R", Rate::func(|y, _t| 0.25 * y.get("I")))?;
//! let trajectory = model.solve(100, None, None)?;
//! println!("peak at day {}", trajectory.peak_day("I")?);
//! # Ok(())
//! # }
//! ```

pub mod contact;
pub mod error;
pub mod model;
pub mod network;
pub mod params;
pub mod schedule;
pub mod series;
pub mod state;

pub use contact::{ContactMatrix, ContactStructure};
pub use error::{EpiError, EpiResult};
pub use model::{
    CompartmentalModel, EpidemicModel, GranularScope, ModelBuilder, ParamSet,
    POPULATION_TOLERANCE,
};
pub use network::CompartmentNetwork;
pub use params::{Dimensions, ParamTable, ParamValue};
pub use schedule::{
    sigmoid_response, Rate, SigmoidSchedule, TimeIndexedSchedule, DEFAULT_INTERVAL,
    DEFAULT_TRANSITION_DAYS,
};
pub use series::{ObservedSeries, Trajectory, TrajectoryEnsemble};
pub use state::{expand_name, State, StateInput, StateLayout};
