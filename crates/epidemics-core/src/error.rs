use thiserror::Error;

pub type EpiResult<T> = Result<T, EpiError>;

/// Errors raised by the core engine.
///
/// Structural and configuration errors are fatal and propagate to the caller
/// unmodified; none of them is retried or swallowed inside the engine.
#[derive(Debug, Error)]
pub enum EpiError {
    #[error("unknown compartment `{0}`")]
    UnknownCompartment(String),

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("parameter `{name}` has no value for dimensions [{dims}]")]
    MissingParameterValue { name: String, dims: String },

    #[error("parameter `{0}` is time-varying and cannot be resolved to a scalar")]
    NonScalarParameter(String),

    #[error("unknown dimension level `{0}`")]
    UnknownDimension(String),

    #[error("state vector has {got} values but the model declares {expected} compartments")]
    StateLength { expected: usize, got: usize },

    #[error("initial state sums to {got:.3} but the declared total population is {expected:.3}")]
    PopulationMismatch { expected: f64, got: f64 },

    #[error("horizon of {n_days} days does not exceed the configured offset of {offset} days")]
    HorizonTooShort { n_days: usize, offset: i64 },

    #[error("seed compartment `{0}` does not match any declared compartment")]
    InvalidSeed(String),

    #[error("granular transitions require dimensions to be declared on the model")]
    NoDimensions,

    #[error("contact matrix for level `{level}` must be {expected}x{expected}, got {rows}x{cols}")]
    ContactShape {
        level: String,
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("derivative for `{compartment}` is non-finite at t={t}")]
    NonFiniteDerivative { compartment: String, t: f64 },

    #[error("integration failed: {0}")]
    Integration(String),

    #[error("`{0}` is not implemented for this model; write a model-specific implementation to use calibration")]
    Unimplemented(&'static str),

    #[error("{0}")]
    InvalidInput(String),
}
