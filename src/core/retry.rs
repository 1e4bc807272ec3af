//! Retry policies.
//!
//! A policy maps `(attempt, max_attempts, error)` to a decision. It is
//! stateless: everything it needs travels with the job, so one policy
//! instance serves every worker.

use std::time::Duration;

use super::job::JobError;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after this delay.
    Retry(Duration),
    /// Give up and hand the job to the dead-letter sink.
    Abandon,
}

/// Decides whether and when a failed job runs again.
pub trait RetryPolicy: Send + Sync + 'static {
    /// `attempt` is the number of attempts made so far (1 after the first
    /// failure).
    fn decide(&self, attempt: u32, max_attempts: u32, error: &JobError) -> RetryDecision;
}

/// `base * 2^attempt`, capped at `max_delay`. Abandons once the attempt
/// budget is spent or the error is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Multiplier for the doubling sequence.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    /// Build a policy.
    #[must_use]
    pub const fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay before the retry that follows attempt `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn decide(&self, attempt: u32, max_attempts: u32, error: &JobError) -> RetryDecision {
        if error.is_permanent() || attempt >= max_attempts {
            return RetryDecision::Abandon;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }
}

/// Same delay before every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl RetryPolicy for FixedDelay {
    fn decide(&self, attempt: u32, max_attempts: u32, error: &JobError) -> RetryDecision {
        if error.is_permanent() || attempt >= max_attempts {
            RetryDecision::Abandon
        } else {
            RetryDecision::Retry(self.0)
        }
    }
}

/// Never retries; the first failure is final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _attempt: u32, _max_attempts: u32, _error: &JobError) -> RetryDecision {
        RetryDecision::Abandon
    }
}
