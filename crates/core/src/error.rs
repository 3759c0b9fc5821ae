//! Core error model.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Parsing and validation failures of core values.
///
/// Infrastructure failures (store, threads) belong to the executor crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. an empty lock owner).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An ISO-8601 duration could not be parsed.
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    /// A failed-job retry schedule could not be parsed.
    #[error("invalid retry schedule '{input}': {reason}")]
    InvalidRetrySchedule { input: String, reason: String },
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_duration(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_retry_schedule(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRetrySchedule {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
