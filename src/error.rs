//! Error types for the admission control service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for admission control operations.
///
/// An admission denial is not an error: it is a successful
/// [`AdmissionResult`](crate::admission::AdmissionResult) with `allowed: false`.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Malformed or missing request fields. Never worth retrying.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The wait queue for a key is at capacity.
    #[error("Queue full for {key}: {size} entries waiting")]
    QueueFull {
        key: String,
        size: usize,
        retry_after: Duration,
    },

    /// A configuration or queue entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unexpected failure in the counter, config or queue store.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        AdmissionError::Validation(msg.into())
    }

    /// Whether a client may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::QueueFull { .. } | AdmissionError::Internal(_)
        )
    }
}

impl From<config::ConfigError> for AdmissionError {
    fn from(err: config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

/// Result type alias for admission control operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
