/*!
Error types for the Codekeep core engine.
*/

use codekeep_retry::{RetryError, RetryableError};
use thiserror::Error;

/// Result type used throughout the Codekeep core.
pub type Result<T> = std::result::Result<T, CodekeepError>;

/// Errors that can occur while reading stores, writing archives, or dispatching jobs.
#[derive(Error, Debug)]
pub enum CodekeepError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage adapter errors that will not go away on retry
    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage adapter errors worth retrying (timeouts, throttling, 5xx)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Key or object name rejected by a store adapter
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// An operation gave up after its retry policy ran out
    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    /// A scheduled handler failed
    #[error("Handler for schedule '{schedule}' failed: {message}")]
    Handler { schedule: String, message: String },
}

impl CodekeepError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new transient storage error
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new invalid key error
    pub fn invalid_key<S: Into<String>>(msg: S) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new handler error
    pub fn handler<S1: Into<String>, S2: Into<String>>(schedule: S1, message: S2) -> Self {
        Self::Handler {
            schedule: schedule.into(),
            message: message.into(),
        }
    }
}

impl RetryableError for CodekeepError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
