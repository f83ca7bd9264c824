//! Bounded exponential backoff for transient processing failures.

use std::time::Duration;

use crate::config::RetryConfig;

/// Retry policy applied to one record's consecutive failures.
///
/// Delays grow exponentially from the base, are capped at the max, and get
/// uniform jitter in the upper half of the computed delay so co-located
/// partitions do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.max_retries)
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Jittered delay for the given zero-based attempt.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let shift = attempt.min(20);
        let capped = base_ms.saturating_mul(1u64 << shift).min(max_ms).max(1);
        let jitter = rand::random::<u64>() % (capped / 2 + 1);
        Duration::from_millis(capped - jitter)
    }
}

/// Consecutive-failure tracker for the record currently in flight.
#[derive(Debug, Default)]
pub(crate) struct BackoffState {
    attempt: u32,
}

impl BackoffState {
    /// The delay before the next retry, or `None` when the policy's retry
    /// budget is exhausted.
    pub(crate) fn next_delay(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if let Some(max) = policy.max_retries() {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Called after a successful iteration.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, retries: Option<u32>) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            retries,
        )
    }

    #[test]
    fn test_delays_stay_within_bounds() {
        let policy = policy(50, 1_000, None);
        for attempt in 0..16 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_millis(1_000));
            assert!(delay >= Duration::from_millis(1));
        }
    }

    #[test]
    fn test_delay_grows_until_capped() {
        let policy = policy(100, 10_000, None);
        // Jitter only subtracts up to half, so a later attempt's minimum
        // possible delay exceeds an early attempt's maximum.
        let early_max = Duration::from_millis(100);
        let late_min = Duration::from_millis(3_200 / 2);
        assert!(policy.delay_for(0) <= early_max);
        assert!(policy.delay_for(5) >= late_min);
    }

    #[test]
    fn test_retry_budget_is_enforced() {
        let policy = policy(1, 10, Some(2));
        let mut backoff = BackoffState::default();
        assert!(backoff.next_delay(&policy).is_some());
        assert!(backoff.next_delay(&policy).is_some());
        assert!(backoff.next_delay(&policy).is_none());
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn test_reset_restores_budget() {
        let policy = policy(1, 10, Some(1));
        let mut backoff = BackoffState::default();
        assert!(backoff.next_delay(&policy).is_some());
        assert!(backoff.next_delay(&policy).is_none());
        backoff.reset();
        assert!(backoff.next_delay(&policy).is_some());
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = policy(1, 10, None);
        let mut backoff = BackoffState::default();
        for _ in 0..100 {
            assert!(backoff.next_delay(&policy).is_some());
        }
    }
}
