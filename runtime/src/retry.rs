//! Redelivery policy for inbound messages.
//!
//! The transport promises at-least-once delivery with automatic retry. The
//! consumer reproduces that by re-running a failed handler a bounded number of
//! times, waiting between attempts, and only for errors that can clear up on
//! their own (see [`FailSafeError::is_retryable`](crate::FailSafeError::is_retryable)).
//!
//! # Example
//!
//! ```rust
//! use failsafe_runtime::retry::{RetryPolicy, retry_while};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::fixed(5, Duration::from_secs(10));
//!
//! let result = retry_while(&policy, || async { Ok::<_, String>(42) }, |_| true).await;
//! assert_eq!(result.ok(), Some(42));
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently to retry.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `initial_delay`: 10 seconds
/// - `max_delay`: 5 minutes
/// - `multiplier`: 1.0 (fixed interval)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: usize,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Growth factor between waits; `1.0` keeps the interval fixed.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Retry `max_retries` times, `interval` apart.
    #[must_use]
    pub const fn fixed(max_retries: usize, interval: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: interval,
            max_delay: Duration::from_secs(300),
            multiplier: 1.0,
        }
    }

    /// Make the wait grow by `multiplier` after each retry.
    #[must_use]
    pub const fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Never retry.
    #[must_use]
    pub const fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Wait before retry number `attempt` (zero-based), capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

/// Why a retried operation finally failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The error is permanent; no retry was attempted for it.
    Permanent(E),
    /// Every allowed attempt failed; holds the last error.
    Exhausted {
        /// Total attempts made, including the first.
        attempts: usize,
        /// Error from the last attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(error) | Self::Exhausted { last: error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent(error) => write!(f, "{error}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            },
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `operation` until it succeeds, fails permanently, or runs out of retries.
///
/// # Errors
///
/// - [`RetryError::Permanent`] as soon as `is_retryable` rejects an error
/// - [`RetryError::Exhausted`] after `policy.max_retries` retries all failed
pub async fn retry_while<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryError::Permanent(err));
                }
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
