//! Error types for the experiment engine.
//!
//! Two layers: [`PhenoscanError`] covers everything that stops a run or a
//! task before work is dispatched, while [`ModelFitError`] is the per-unit,
//! recoverable failure that becomes an `is_failed` result row.

use thiserror::Error;

/// Fatal error taxonomy for the engine.
#[derive(Error, Debug)]
pub enum PhenoscanError {
    /// Pre-flight configuration problems: unknown outcome/covariate name,
    /// empty unit set, type mismatches. Fatal for the task, detected before
    /// any work is dispatched.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Sample count/order mismatch between the genotype and phenotype
    /// providers. Fatal for the whole run.
    #[error("sample alignment error: {message}")]
    Alignment { message: String },

    /// Any failure writing to or reading from the result store.
    #[error("result store error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PhenoscanError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn alignment(message: impl Into<String>) -> Self {
        Self::Alignment {
            message: message.into(),
        }
    }
}

/// Type alias for results using [`PhenoscanError`].
pub type Result<T> = std::result::Result<T, PhenoscanError>;

/// Unit-level model failure. Recorded as a failed result row; never aborts
/// the task.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelFitError {
    /// Collinear or otherwise non-invertible design matrix.
    #[error("singular design matrix: {0}")]
    SingularDesign(String),

    /// Perfect or quasi-perfect separation in a logistic fit.
    #[error("perfect separation: {0}")]
    Separation(String),

    /// The analyzed unit has no in-sample variance.
    #[error("zero variance: {0}")]
    ZeroVariance(String),

    /// Iterative fit failed to converge.
    #[error("no convergence after {iterations} iterations")]
    NonConvergence { iterations: usize },

    /// Fewer complete-case observations than model parameters.
    #[error("too few observations: {observed} for {parameters} parameters")]
    TooFewObservations {
        observed: usize,
        parameters: usize,
    },

    /// Any other numerical failure (invalid distribution parameters,
    /// non-finite intermediate values).
    #[error("numerical failure: {0}")]
    Numeric(String),
}
