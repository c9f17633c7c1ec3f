//! Retry and backoff policies for Codekeep store adapters
//!
//! Adapters classify their own errors through [`RetryableError`]. Transient
//! failures are retried under an exponential backoff policy; a permanent
//! failure ends the loop on the attempt that produced it.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported once a retried operation gives up
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded retry budget after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded { operation, .. } | Self::Permanent { operation, .. } => {
                operation
            }
        }
    }

    /// True when the operation kept failing transiently until the policy gave up
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Execute an operation with the default exponential backoff policy
///
/// The closure receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    with_custom_backoff(op_name, default_backoff_policy(), f).await
}

/// Execute an operation with a caller-supplied backoff policy
pub async fn with_custom_backoff<T, E, F, Fut>(
    op_name: &'static str,
    policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    let mut attempt = 0usize;

    let result = backoff::future::retry_notify(
        policy,
        || {
            attempt += 1;
            debug!(operation = op_name, attempt, "Attempting operation");
            let fut = f(attempt);
            async move {
                fut.await.map_err(|err| {
                    if err.is_transient() {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        },
        |err: E, delay: Duration| {
            warn!(
                operation = op_name,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Operation failed with transient error, retrying"
            );
        },
    )
    .await;

    match result {
        Ok(value) => {
            if attempt > 1 {
                debug!(operation = op_name, attempts = attempt, "Operation succeeded after retry");
            }
            Ok(value)
        }
        Err(err) if err.is_transient() => {
            warn!(operation = op_name, attempts = attempt, error = %err, "Retry budget exhausted");
            Err(RetryError::MaxRetriesExceeded {
                operation: op_name,
                attempts: attempt,
                source: Box::new(err),
            })
        }
        Err(err) => Err(RetryError::Permanent {
            operation: op_name,
            source: Box::new(err),
        }),
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy optimized for cloud object storage operations
pub fn cloud_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .with_multiplier(1.5)
        .build()
}
