//! # Exponential Backoff
//!
//! Provides the exponential backoff used to throttle allocation retries.
//! Each wait doubles the previous one, starting at a short base interval and
//! capped at a long maximum, so a persistently unfulfillable request settles
//! at one attempt per `max` instead of one per reconcile.

use std::time::Duration;

/// Exponential backoff calculator
///
/// Generates backoff durations `base, 2*base, 4*base, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Next wait to hand out
    current: Duration,
    /// Ceiling for every wait
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given base and ceiling
    ///
    /// # Arguments
    ///
    /// * `base` - First backoff duration (typically 1s)
    /// * `max` - Maximum backoff duration (typically 5m)
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(16));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(100), Duration::from_secs(300));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(100));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(200));
        // Next would be 400s, but should be capped at 300s
        assert_eq!(backoff.next_backoff(), Duration::from_secs(300));
        // Should stay at max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(300));
    }

    #[test]
    fn test_base_above_max_is_clamped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(600), Duration::from_secs(300));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(300));
    }
}
