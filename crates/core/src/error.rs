//! Engine error taxonomy.

use lendscope_chain::{PriceError, SourceError};
use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// "No viable option" is not an error: routing returns `Ok(None)`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Adapter or price fetch failed or returned stale data. Retried next cycle.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Caller input rejected (negative/NaN amount, unknown asset or position).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal invariant failed. Indicates a bug and is never swallowed.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<SourceError> for EngineError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Cancelled => Self::Cancelled,
            other => Self::DataUnavailable(other.to_string()),
        }
    }
}

impl From<PriceError> for EngineError {
    fn from(e: PriceError) -> Self {
        Self::DataUnavailable(e.to_string())
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
