use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error type returned by the linear algebra backends.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

/// A failed region fit, reported by index so the remaining regions stay usable.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionFailure {
    pub region: usize,
    pub message: String,
}

/// Errors raised by the alignment estimators, the region cache and the orchestrator.
#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "optimal transport did not converge within {max_iter} iterations (marginal error {error:.3e}, tolerance {tol:.3e})"
    )]
    ConvergenceFailure { max_iter: usize, error: f64, tol: f64 },

    #[error("no cached fit for region {region} of partition '{partition}'")]
    MissingCacheEntry { partition: String, region: usize },

    #[error("estimator used before fit")]
    NotFitted,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("linear algebra backend failed: {0}")]
    Linalg(String),

    #[error("region cache I/O failed at {path:?}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("region cache record could not be encoded or decoded: {0}")]
    CacheCodec(String),

    #[error("{} of {} regions failed to fit (first: region {})", .failures.len(), .total, .failures.first().map_or(0, |f| f.region))]
    RegionFailures {
        total: usize,
        failures: Vec<RegionFailure>,
    },
}

impl From<ThreadSafeStdError> for AlignmentError {
    fn from(e: ThreadSafeStdError) -> Self {
        AlignmentError::Linalg(e.to_string())
    }
}

impl AlignmentError {
    pub(crate) fn shape(context: &'static str, expected: usize, found: usize) -> Self {
        AlignmentError::ShapeMismatch {
            context,
            expected,
            found,
        }
    }
}
