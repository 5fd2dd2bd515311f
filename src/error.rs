use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Formula-level failure raised by a feature's compute function.
///
/// These are expected data conditions (a column the formula needs is absent,
/// not enough history) rather than bugs, so they travel as values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    #[error("missing required column '{0}'")]
    MissingColumn(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid value in column '{column}': {reason}")]
    InvalidValue { column: String, reason: String },
}

/// Caller-visible failure of a single feature request.
#[derive(Debug, Clone, Error)]
pub enum FeatureError {
    /// The requested name is not in the registry. Never retried.
    #[error("feature '{0}' is not registered")]
    NotFound(String),

    /// The formula rejected well-formed input.
    #[error("feature '{feature}' failed: {cause}")]
    Computation { feature: String, cause: ComputeError },

    /// The computation did not finish inside the request budget.
    #[error("feature '{feature}' exceeded its {}ms budget", timeout.as_millis())]
    TimeoutExceeded { feature: String, timeout: Duration },

    /// Short-circuited by the feature's breaker before any attempt was made.
    #[error("circuit breaker is open for feature '{0}'")]
    CircuitOpen(String),

    /// The registered function broke the registry contract (wrong output
    /// length, panic). Indicates a registration bug, not a data condition.
    #[error("feature '{feature}' violated its contract: {detail}")]
    ContractViolation { feature: String, detail: String },
}

impl FeatureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeatureError::NotFound(_) => ErrorKind::NotFound,
            FeatureError::Computation { .. } => ErrorKind::ComputationError,
            FeatureError::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            FeatureError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            FeatureError::ContractViolation { .. } => ErrorKind::ContractViolation,
        }
    }

    /// Whether this outcome is an attempted invocation that failed, and so
    /// moves the feature's breaker towards Open.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            FeatureError::Computation { .. }
                | FeatureError::TimeoutExceeded { .. }
                | FeatureError::ContractViolation { .. }
        )
    }
}

/// Discriminant of [`FeatureError`], used for responses and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ComputationError,
    TimeoutExceeded,
    CircuitOpen,
    ContractViolation,
}

/// Serializable error descriptor carried by a `FeatureResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FeatureError> for ErrorInfo {
    fn from(err: &FeatureError) -> Self {
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Cache backend failure. Never surfaced to callers: the cache degrades to
/// miss / no-op write instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
