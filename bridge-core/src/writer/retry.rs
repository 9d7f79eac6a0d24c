//! Retry budget and exponential backoff

use rand::Rng;
use std::time::Duration;

/// How often, and how far apart, a failing batch is attempted
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed delay, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(crate::config::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(crate::config::RETRY_MAX_DELAY_MS),
            jitter: crate::config::RETRY_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have failed
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt, after `attempt` failures.
    ///
    /// `base * 2^(attempt - 1)` plus up to `jitter` of itself, never above
    /// `max_delay`. With `jitter <= 1.0` successive delays never decrease.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let mut delay = self.base_delay.saturating_mul(1u32 << exponent);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.0..=jitter);
            delay = delay.saturating_add(delay.mul_f64(factor));
        }

        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter,
        }
    }

    #[test]
    fn test_exponential_and_capped() {
        let policy = policy(0.0);
        let delays: Vec<u64> = (1..=8)
            .map(|a| policy.delay_for(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn test_jitter_bounds_and_order() {
        let policy = policy(0.5);
        for _ in 0..100 {
            let mut previous = Duration::ZERO;
            for attempt in 1..=10 {
                let delay = policy.delay_for(attempt);
                let base = policy.base_delay * (1 << (attempt - 1));
                assert!(delay >= base.min(policy.max_delay));
                assert!(delay <= policy.max_delay);
                assert!(delay >= previous);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..policy(0.0)
        };
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
