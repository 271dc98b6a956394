//! Retry logic with exponential backoff
//!
//! Transient failures are retried with a delay of
//! `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`, with
//! optional jitter. Permanent failures return after the first attempt.
//!
//! Errors carrying a provider wait hint (flood control) are slept through
//! without spending the retry budget. They have an allowance of their own,
//! `max_retries + 1` waits per call, after which they are retried like any
//! other transient failure.
//!
//! # Example
//!
//! ```no_run
//! use chat_history_dl::retry::{IsRetryable, execute};
//! use chat_history_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let result = execute(&config, "fetch thing", || async {
//!     Ok::<_, MyError>(())
//! })
//! .await;
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, ErrorClass};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, provider busy, connection reset) should return `true`.
/// Permanent failures (not found, permission denied, corrupt handle) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Minimum wait the provider asked for before the next attempt, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Throttle)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Throttled { wait } => Some(*wait),
            _ => None,
        }
    }
}

/// Typed failure returned once an operation gives up
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E> {
    /// Name of the operation that failed
    pub operation: String,
    /// Attempts performed, including the first
    pub attempts: u32,
    /// True if the error was retryable and the budget ran out
    pub exhausted: bool,
    /// Error from the final attempt
    pub last_error: E,
}

/// Per-call retry bookkeeping, dropped on success or final failure
#[derive(Debug)]
struct RetryBudget {
    attempt: u32,
    max_retries: u32,
    delay: Duration,
    provider_waits: u32,
}

impl RetryBudget {
    fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            max_retries: config.max_retries,
            delay: config.initial_backoff,
            provider_waits: 0,
        }
    }

    fn has_retry_left(&self) -> bool {
        self.attempt < self.max_retries
    }

    fn has_provider_wait_left(&self) -> bool {
        self.provider_waits <= self.max_retries
    }

    /// Calls made so far, including the one that just failed
    fn calls(&self) -> u32 {
        self.attempt + self.provider_waits + 1
    }

    /// Consume one retry and return the delay to wait before it
    fn next_delay(&mut self, config: &RetryConfig) -> Duration {
        self.attempt += 1;
        let current = self.delay.min(config.max_backoff);
        let next = self.delay.as_secs_f64() * config.backoff_multiplier;
        self.delay = Duration::try_from_secs_f64(next)
            .unwrap_or(config.max_backoff)
            .min(config.max_backoff);
        current
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// `max_retries = 0` performs exactly one attempt for plain transient
/// errors. A zero initial backoff retries immediately. An error carrying a
/// provider wait hint is slept through for the hinted time and does not count
/// as an attempt; once the hint allowance is used up the longer of the hint
/// and the scheduled backoff is used and the attempt is counted.
pub async fn execute<F, Fut, T, E>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut budget = RetryBudget::new(config);

    loop {
        match op().await {
            Ok(result) => {
                if budget.calls() > 1 {
                    tracing::info!(
                        operation,
                        attempts = budget.calls(),
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.retry_after().is_some() && budget.has_provider_wait_left() => {
                let wait = e.retry_after().unwrap_or_default();
                budget.provider_waits += 1;
                tracing::warn!(
                    operation,
                    error = %e,
                    provider_waits = budget.provider_waits,
                    delay_ms = wait.as_millis(),
                    "Provider asked to wait, retrying without spending an attempt"
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            Err(e) if e.is_retryable() && budget.has_retry_left() => {
                let backoff = budget.next_delay(config);
                let backoff = if config.jitter {
                    add_jitter(backoff)
                } else {
                    backoff
                };
                let wait = e.retry_after().map_or(backoff, |hint| hint.max(backoff));

                tracing::warn!(
                    operation,
                    error = %e,
                    attempt = budget.attempt,
                    max_retries = config.max_retries,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            Err(e) => {
                let exhausted = e.is_retryable();
                if exhausted {
                    tracing::error!(
                        operation,
                        error = %e,
                        attempts = budget.calls(),
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::warn!(operation, error = %e, "Operation failed with non-retryable error");
                }
                return Err(RetryError {
                    operation: operation.to_string(),
                    attempts: budget.calls(),
                    exhausted,
                    last_error: e,
                });
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
