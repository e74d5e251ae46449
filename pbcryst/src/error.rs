use diffsol::error::DiffsolError;
use thiserror::Error;

/// Custom error type for pbcryst
///
/// Wraps all errors that can occur when configuring or running a
/// crystallizer simulation.
#[derive(Error, Debug)]
pub enum CrystError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Attachment error: {0}")]
    AttachError(#[from] AttachError),
    #[error("Solve error: {0}")]
    SolveError(#[from] SolveError),
    #[error("Error: {0}")]
    Other(String),
}

/// Errors raised while validating a crystallizer configuration. These are
/// always raised at build time, never once an integration is running.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("automatic differentiation backend selected but the autodiff feature is not enabled")]
    AutodiffUnavailable,
    #[error("analytical jacobian unavailable: {0}")]
    AnalyticalUnsupported(String),
    #[error("size grid must be strictly increasing")]
    GridNotMonotone,
    #[error("size grid must be uniformly spaced: {0}")]
    GridNotUniform(String),
    #[error("size grid needs at least two cells, got {0}")]
    GridTooSmall(usize),
    #[error("parameter mask has length {found}, kinetics model has {expected} parameters")]
    MaskWrongLength { expected: usize, found: usize },
    #[error("scale factor must be positive, got {0}")]
    ScaleNotPositive(f64),
    #[error("moment representation needs at least four moments, got {0}")]
    TooFewMoments(usize),
    #[error("sensitivity analysis requested but the parameter mask frees no parameters")]
    NoFreeParameters,
    #[error("heat-transfer media must be configured when the jacket balance is active")]
    JacketMediaRequired,
    #[error("{name} must be positive, got {value}")]
    NonPositiveSetting { name: &'static str, value: f64 },
    #[error("Error: {0}")]
    Other(String),
}

/// Errors raised when phases, kinetics or feeds are attached in an
/// unsupported combination, or are missing when a solve starts.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("unsupported phase combination: {0}")]
    UnsupportedPhases(String),
    #[error("no phases attached")]
    PhasesNotAttached,
    #[error("continuous and semibatch operation need an inlet attached")]
    InletNotAttached,
    #[error("target species index {index} out of range for {species} species")]
    TargetSpeciesOutOfRange { index: usize, species: usize },
    #[error("feed composition has {found} species, tank liquid has {expected}")]
    FeedSpeciesMismatch { expected: usize, found: usize },
    #[error("feed distribution has length {found}, expected {expected}")]
    FeedDistributionMismatch { expected: usize, found: usize },
    #[error("Error: {0}")]
    Other(String),
}

/// Errors surfaced by a simulation run. Integrator failures are passed
/// through unchanged; no retry is attempted.
#[derive(Error, Debug)]
pub enum SolveError {
    #[error("integrator error: {0}")]
    Integrator(#[from] DiffsolError),
    #[error("output times must be an increasing grid starting at or after the elapsed time")]
    InvalidTimeGrid,
    #[error("run duration must be positive, got {0}")]
    NonPositiveDuration(f64),
    #[error("steady state iteration did not converge after {iterations} iterations, residual {residual}")]
    SteadyStateDiverged { iterations: usize, residual: f64 },
    #[error("steady state needs a positive growth rate, got {0}")]
    NonPositiveGrowth(f64),
    #[error("Error: {0}")]
    Other(String),
}

#[macro_export]
macro_rules! config_error {
    ($variant:ident) => {
        $crate::error::CrystError::from($crate::error::ConfigError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::CrystError::from($crate::error::ConfigError::$variant($($arg)*.to_string()))
    };
}

#[macro_export]
macro_rules! attach_error {
    ($variant:ident) => {
        $crate::error::CrystError::from($crate::error::AttachError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::CrystError::from($crate::error::AttachError::$variant($($arg)*.to_string()))
    };
}

#[macro_export]
macro_rules! solve_error {
    ($variant:ident) => {
        $crate::error::CrystError::from($crate::error::SolveError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::CrystError::from($crate::error::SolveError::$variant($($arg)*.to_string()))
    };
}
