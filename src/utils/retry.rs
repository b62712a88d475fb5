//! Fixed-delay retry policy
//!
//! Hardware bring-up retries forever in production; tests and tools may bound
//! the number of attempts instead.

use std::time::Duration;

/// Default delay between two probe attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Retry policy: constant delay, optionally bounded attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Minimum delay between two attempts
    pub delay: Duration,
    /// Maximum number of attempts (`None` = retry forever)
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with the given delay
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Give up after `max_attempts` attempts
    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }

    /// Whether another attempt may follow `attempts_made` failed ones
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_always_allows() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay, DEFAULT_RETRY_DELAY);
        assert!(policy.allows_another(0));
        assert!(policy.allows_another(u32::MAX));
    }

    #[test]
    fn test_bounded_stops() {
        let policy = RetryPolicy::bounded(Duration::from_millis(10), 3);
        assert!(policy.allows_another(0));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
