//! Step-level error type.

use thiserror::Error;

/// Errors returned by a step executor.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: the step is attempted again with exponential back-off while
///   attempts remain.
/// - `Fatal`: the step is immediately marked as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Transient failure; the engine may re-try the step.
    #[error("retryable step error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal step error: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
