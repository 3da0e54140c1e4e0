//! Retries for cluster writes
//!
//! Transient failures (API server unavailable, timeouts) are retried with
//! jittered exponential backoff by [`retry_transient`]. Optimistic
//! concurrency conflicts are retried immediately by [`retry_on_conflict`],
//! since the next attempt re-reads and the stale read was the only problem.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Backoff settings for transient write failures
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total calls before giving up; at least one call is always made
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default delays with a different attempt budget
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Delays between attempts, each jittered to 0.5x..1.5x
struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let base = self.next;
        self.next = base.mul_f64(self.multiplier).min(self.max);
        Some(base.mul_f64(rand::thread_rng().gen_range(0.5..1.5)))
    }
}

/// Run a cluster write, retrying errors that [`Error::is_retryable`] accepts
///
/// Permanent errors and the error of the last attempt are returned as is.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = config.max_attempts.max(1);
    let mut delays = config.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !e.is_retryable() {
            debug!(operation = %operation_name, attempt, error = %e, "Permanent failure");
            return Err(e);
        }
        if attempt >= attempts {
            warn!(
                operation = %operation_name,
                attempts,
                error = %e,
                "Giving up after transient failures"
            );
            return Err(e);
        }
        let delay = delays.next().unwrap_or(config.max_delay);
        debug!(
            operation = %operation_name,
            attempt,
            delay_ms = delay.as_millis(),
            error = %e,
            "Transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Retry a read-modify-write operation while it reports [`Error::Conflict`]
///
/// The operation must re-read the current state on every call. `attempts`
/// bounds the total number of calls (values below 1 are treated as 1). Any
/// other error is returned as is.
pub async fn retry_on_conflict<F, Fut, T>(
    attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Write conflict, re-reading"
                );
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    operation = %operation_name,
                    attempts,
                    error = %e,
                    "Write conflict persisted after all attempts"
                );
                return Err(e);
            }
            other => return other,
        }
    }
}
