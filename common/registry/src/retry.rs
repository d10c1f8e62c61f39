//! # Retry
//!
//! Bounded exponential backoff used when a liveness task has to re-register
//! an instance from scratch after losing its lease or TTL check.
use std::future::Future;
use std::time;

use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Clone, Debug)]
/// A retry policy to determine how re-registration is attempted.
pub struct RetryPolicy {
    /// Attempts before the liveness task gives up. Always at least one.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval before the second attempt.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the pause taken after a failed attempt number (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(30)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

/// Result of [`retry`].
#[derive(Debug)]
pub(crate) enum Retried<T> {
    Done(T),
    /// The token was cancelled between attempts.
    Cancelled,
    /// Every attempt failed; carries the last error.
    Exhausted(Error),
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
pub(crate) async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Retried::Cancelled;
        }
        let err = match op().await {
            Ok(value) => return Retried::Done(value),
            Err(err) => err,
        };
        if attempt >= policy.max_attempts {
            return Retried::Exhausted(err);
        }
        let pause = policy.retry_interval(attempt);
        tracing::warn!(
            operation = op_name,
            attempt,
            max_attempts = policy.max_attempts,
            retry_in_ms = pause.as_millis() as u64,
            error = %err,
            "registry operation failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Retried::Cancelled,
            _ = tokio::time::sleep(pause) => {}
        }
        attempt += 1;
    }
}
