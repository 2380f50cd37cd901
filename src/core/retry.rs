//! Backoff for transient I/O failures.
//!
//! Shared by the link checker and the LLM engine. Attempts are 1-indexed;
//! the delay after attempt `n` doubles from `initial_delay` up to
//! `max_delay`. A server-supplied wait (`Retry-After`) is honoured when it
//! is longer than the computed backoff.

use std::time::Duration;

/// Upper bound on any single backoff
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first, never below 1
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: MAX_DELAY,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Wait before the attempt after `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    /// Backoff, stretched to a server hint when one is given
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        hint.map_or(backoff, |hint| backoff.max(hint.min(self.max_delay)))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_cap() {
        let policy = RetryPolicy::new(5, 500).with_max_delay(Duration::from_secs(3));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3));
    }

    #[test]
    fn test_hint_only_lengthens() {
        let policy = RetryPolicy::new(3, 1000);
        assert_eq!(policy.delay_with_hint(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay_with_hint(1, Some(Duration::from_millis(10))), Duration::from_secs(1));
        assert_eq!(policy.delay_with_hint(1, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(policy.delay_with_hint(1, Some(Duration::from_secs(600))), MAX_DELAY);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(2, 10);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let single = RetryPolicy::new(0, 10);
        assert_eq!(single.max_attempts, 1);
        assert!(!single.should_retry(1));
    }
}
