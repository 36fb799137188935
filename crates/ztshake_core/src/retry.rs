//! Fixed-delay retry policy.

use std::time::Duration;

/// Bounded, fixed-delay polling.
///
/// The store has no wait/notify primitive, so every retry loop in this
/// crate polls: worst-case latency is `max_attempts * delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Lock acquisition default: 5 attempts, 3 seconds apart.
    pub const fn lock_default() -> Self {
        Self::new(5, Duration::from_secs(3))
    }

    /// Conflicting-write default: first attempt plus 10 retries, 1 second apart.
    pub const fn write_default() -> Self {
        Self::new(11, Duration::from_secs(1))
    }

    /// Number of attempts, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Sleep for the configured delay.
    pub async fn wait(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(RetryPolicy::lock_default().attempts(), 5);
        assert_eq!(RetryPolicy::lock_default().delay, Duration::from_secs(3));
        assert_eq!(RetryPolicy::write_default().attempts(), 11);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_should_retry_until_budget_spent() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
