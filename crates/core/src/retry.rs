//! Retry policy shared by submission and confirmation tracking.
//!
//! [`retry`] drives an operation in place; [`Attempts`] is the bare failure
//! budget for loops that spread their attempts across ticks.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::metrics::record_retry;

/// How many times to retry a transient failure, and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. The budget is exhausted by failure
    /// number `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Growth factor between retries (1 = fixed delay).
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
            multiplier: 1,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            multiplier: 1,
            max_delay: delay,
        }
    }

    /// Exponential policy, doubling up to `max_delay`.
    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            multiplier: 2,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay.max(self.delay))
    }

    /// Fresh failure budget under this policy.
    pub fn budget(&self) -> Attempts {
        Attempts {
            policy: *self,
            failures: 0,
        }
    }
}

/// Outcome of recording one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Try again after the delay.
    Retry(Duration),
    /// More than `max_retries` consecutive failures.
    Exhausted,
}

/// Consecutive-failure counter. Held in memory only.
#[derive(Debug, Clone)]
pub struct Attempts {
    policy: RetryPolicy,
    failures: u32,
}

impl Attempts {
    pub fn record_failure(&mut self) -> Backoff {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_retries {
            Backoff::Exhausted
        } else {
            Backoff::Retry(self.policy.delay_for(self.failures))
        }
    }

    /// Forget earlier failures after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Only errors for which `is_transient` returns `true` are retried. The last
/// error is returned once the budget is spent.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = policy.budget();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => match attempts.record_failure() {
                Backoff::Retry(delay) => {
                    warn!(
                        operation,
                        attempt = attempts.failures(),
                        max_retries = policy.max_retries,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "⚠️  Transient failure, retrying..."
                    );
                    record_retry(operation);
                    tokio::time::sleep(delay).await;
                }
                Backoff::Exhausted => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
