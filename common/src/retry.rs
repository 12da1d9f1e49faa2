// Retry delay strategies for the dispatcher's bounded within-tick retries

use rand::Rng;
use std::time::Duration;

/// Computes the delay before retry attempt `attempt` (zero-based)
pub trait RetryStrategy: Send + Sync {
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with jitter
///
/// Delays stay sub-second by default: all retries for a fire happen inside
/// the tick that produced it. Jitter keeps concurrent failing keys from
/// retrying in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay in milliseconds (default: 100)
    base_delay_ms: u64,
    /// Maximum delay in milliseconds (default: 2000)
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0, default: 0.1 = 10%)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 2000,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        // 100ms, 300ms, 900ms, ... capped at max_delay
        let delay = self
            .base_delay_ms
            .saturating_mul(3_u64.saturating_pow(attempt));
        delay.min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let mut rng = rand::thread_rng();
        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;

        let jitter_ms = if jitter_range_ms > 0 {
            rng.gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.add_jitter_ms(self.base_delay_ms(attempt)))
    }
}

/// Fixed delay strategy (for tests or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn delay_for(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially_without_jitter() {
        let backoff = ExponentialBackoff::with_config(100, 10_000, 0.0);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(300));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(900));
    }

    #[test]
    fn test_backoff_is_capped_at_max_delay() {
        let backoff = ExponentialBackoff::with_config(100, 500, 0.0);
        assert_eq!(backoff.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let backoff = ExponentialBackoff::with_config(1000, 10_000, 0.5);
        for _ in 0..100 {
            let delay = backoff.delay_for(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let backoff = ExponentialBackoff::with_config(100, 2000, 0.0);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(2000));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let fixed = FixedDelay::new(Duration::from_millis(50));
        assert_eq!(fixed.delay_for(0), Duration::from_millis(50));
        assert_eq!(fixed.delay_for(9), Duration::from_millis(50));
    }
}
