use std::time::Duration;

/// How a failed step attempt was classified for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient collaborator failure.
    Retryable,
    /// The step exceeded its wall-clock timeout.
    Timeout,
    /// Unrecoverable input problem; retrying cannot help.
    Permanent,
}

/// Decision produced by [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the given delay.
    Retry(Duration),
    /// Stop retrying; the step drives the workflow to `Failed`.
    GiveUp,
}

/// Exponential-backoff retry policy for failed pipeline steps.
///
/// The policy is stateless and pure given its inputs: attempt counters live
/// on the workflow record, and jitter is derived deterministically from a
/// caller-supplied seed, so the same failure always yields the same decision.
///
/// Delays follow `min(max_interval, initial_interval * 2^(attempt - 1))`
/// with ±20% jitter, and attempts are capped at `max_attempts` before
/// [`RetryDecision::GiveUp`]. Permanent failures give up immediately
/// regardless of attempt count.
///
/// # Examples
///
/// ```
/// use docflow::{FailureKind, RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(300));
///
/// // First failure: retry after roughly 5s (±20% jitter).
/// match policy.decide(1, FailureKind::Retryable, 42) {
///     RetryDecision::Retry(delay) => assert!(delay >= Duration::from_secs(4)),
///     RetryDecision::GiveUp => unreachable!(),
/// }
///
/// // Third failure exhausts the default budget.
/// assert_eq!(
///     policy.decide(3, FailureKind::Retryable, 42),
///     RetryDecision::GiveUp,
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given budget and backoff bounds.
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            max_interval,
        }
    }

    /// Maximum number of attempts before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after attempt `attempt_number` (1-based) failed.
    ///
    /// `jitter_seed` should be stable for the attempt (the idempotency key's
    /// seed) so the decision replays identically after a crash, while
    /// differing across documents to avoid thundering-herd retries against a
    /// shared collaborator outage.
    pub fn decide(
        &self,
        attempt_number: u32,
        failure: FailureKind,
        jitter_seed: u64,
    ) -> RetryDecision {
        if failure == FailureKind::Permanent {
            return RetryDecision::GiveUp;
        }
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let base = self.base_delay(attempt_number);
        RetryDecision::Retry(apply_jitter(base, jitter_seed))
    }

    /// Backoff delay before jitter: `min(max, initial * 2^(attempt-1))`.
    fn base_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(32);
        let millis = (self.initial_interval.as_millis() as u64)
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        Duration::from_millis(millis.min(self.max_interval.as_millis() as u64))
    }
}

/// Applies deterministic ±20% jitter derived from the seed.
fn apply_jitter(delay: Duration, seed: u64) -> Duration {
    // Percentage offset in [-20, +20], stable for a given seed.
    let offset = (seed % 41) as i64 - 20;
    let millis = delay.as_millis() as i64;
    let jittered = millis + millis * offset / 100;
    Duration::from_millis(jittered.max(0) as u64)
}
