//! Reconnect retry policy.

use std::time::Duration;

use super::config::RetryConfig;

/// Exponential backoff state owned by one connection manager.
///
/// After `n` consecutive failures the delay is `min(initial * factor^n, max)`.
/// The delay is derived from the failure count instead of being multiplied in
/// place, so it never drifts from that formula through rounding.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    factor: f64,
    max: Duration,
    failures: u32,
}

impl RetryPolicy {
    /// Builds a policy from configuration. Factors below 1.0 are raised to
    /// 1.0 so the delay never shrinks between failures.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        let factor = if config.growth_factor.is_finite() {
            config.growth_factor.max(1.0)
        } else {
            1.0
        };
        Self {
            initial: config.initial_delay.min(config.max_delay),
            factor,
            max: config.max_delay,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        let exponent = i32::try_from(self.failures).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max),
            Err(_) => self.max,
        }
    }

    /// Records a failed attempt.
    ///
    /// Returns the delay to wait before reconnecting, then grows the delay
    /// for the attempt after that.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.current_delay();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Returns the policy to its initial delay.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn config(initial_ms: u64, factor: f64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(initial_ms),
            growth_factor: factor,
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn first_delay_is_initial() {
        let mut policy = RetryPolicy::new(&config(500, 2.0, 10_000));
        assert_eq!(policy.current_delay(), Duration::from_millis(500));
        assert_eq!(policy.record_failure(), Duration::from_millis(500));
        assert_eq!(policy.current_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn delay_grows_until_cap() {
        let mut policy = RetryPolicy::new(&config(1000, 2.0, 5000));
        let waits: Vec<u128> = (0..6).map(|_| policy.record_failure().as_millis()).collect();
        assert_eq!(waits, vec![1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut policy = RetryPolicy::new(&config(100, 3.0, 10_000));
        policy.record_failure();
        policy.record_failure();
        assert_eq!(policy.failures(), 2);

        policy.reset();
        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.current_delay(), Duration::from_millis(100));
    }

    #[test]
    fn shrinking_factor_is_clamped() {
        let mut policy = RetryPolicy::new(&config(1000, 0.5, 5000));
        policy.record_failure();
        assert_eq!(policy.current_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn huge_failure_counts_saturate_at_cap() {
        let mut policy = RetryPolicy::new(&config(1000, 10.0, 60_000));
        for _ in 0..2000 {
            policy.record_failure();
        }
        assert_eq!(policy.current_delay(), Duration::from_millis(60_000));
    }

    proptest! {
        #[test]
        fn delay_after_n_failures_matches_formula(
            initial_ms in 1u64..5_000,
            factor in 1.0f64..4.0,
            cap_ms in 5_000u64..120_000,
            n in 0u32..40,
        ) {
            let mut policy = RetryPolicy::new(&config(initial_ms, factor, cap_ms));
            for _ in 0..n {
                policy.record_failure();
            }

            let secs = Duration::from_millis(initial_ms).as_secs_f64() * factor.powi(i32::try_from(n).unwrap());
            let expected = Duration::try_from_secs_f64(secs)
                .map_or(Duration::from_millis(cap_ms), |d| d.min(Duration::from_millis(cap_ms)));
            prop_assert_eq!(policy.current_delay(), expected);
        }

        #[test]
        fn delay_is_non_decreasing(factor in 1.0f64..3.0, n in 1u32..30) {
            let mut policy = RetryPolicy::new(&config(250, factor, 30_000));
            let mut previous = Duration::ZERO;
            for _ in 0..n {
                let delay = policy.record_failure();
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
