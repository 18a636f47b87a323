//! Error taxonomy for the detection and diagnosis pipeline
//!
//! Three classes of failure are distinguished:
//! - Configuration errors, raised at construction or dispatch time and never defaulted
//! - Transient I/O errors from the metrics store or the statistical engine
//! - Scheduler misuse (duplicate registration, use after stop)
//!
//! Insufficient data is deliberately not an error; callers log a warning and skip.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = RootsError> = std::result::Result<T, E>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum RootsError {
    /// Invalid thresholds, unknown strategy names, malformed properties
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    DataStore(#[from] DataStoreError),

    #[error(transparent)]
    Stats(#[from] StatsError),

    /// An item with the same application is already scheduled
    #[error("a scheduled item already exists for application: {0}")]
    DuplicateItem(String),

    #[error("scheduler {0} is not running")]
    SchedulerStopped(String),
}

impl RootsError {
    pub fn config(message: impl Into<String>) -> Self {
        RootsError::Config(message.into())
    }

    /// Transient failures are retried on the next scheduled firing
    pub fn is_transient(&self) -> bool {
        match self {
            RootsError::DataStore(e) => e.is_transient(),
            RootsError::Stats(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Failures reported by a metrics store
#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("data store unavailable: {0}")]
    Unavailable(String),

    #[error("data store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed data store response: {0}")]
    Protocol(String),

    /// Operation strings must look like `"GET /path"`
    #[error("invalid operation string: {0:?}")]
    InvalidOperation(String),

    #[error("invalid time window: start {start} must precede end {end}")]
    InvalidWindow { start: i64, end: i64 },
}

impl DataStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataStoreError::Unavailable(_) | DataStoreError::Timeout(_) | DataStoreError::Protocol(_)
        )
    }
}

/// Failures reported by the statistical engine
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("no statistics session became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("statistics session failed: {0}")]
    SessionFailed(String),

    #[error("frame has {rows} rows, at least {required} are required")]
    InsufficientRows { rows: usize, required: usize },

    #[error("frame row has {actual} columns, expected {expected}")]
    ColumnMismatch { expected: usize, actual: usize },

    #[error("relative importance supports at most {max} predictors, got {actual}")]
    TooManyPredictors { max: usize, actual: usize },

    /// The model cannot be fitted (e.g. the response never varies)
    #[error("degenerate model: {0}")]
    Degenerate(String),
}

impl StatsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StatsError::PoolExhausted(_) | StatsError::SessionFailed(_))
    }
}
