//! Exponential backoff with jitter for requeues after failures.

use rand::Rng;
use std::time::Duration;

/// Delay policy for consecutive failures of one identity
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Fraction of the delay that is randomised away, in `[0, 1]`
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        self.delay_with_sample(failures, sample)
    }

    /// Delay for a given jitter sample in `[0, 1)`; never exceeds `max`
    pub fn delay_with_sample(&self, failures: u32, sample: f64) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let capped = self.base.saturating_mul(1u32 << exponent).min(self.max);
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return capped;
        }
        capped.mul_f64(1.0 - jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(500), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_failures_uses_base() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(1), 0.0);
        assert_eq!(backoff.delay(0), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_shortens_delay() {
        let backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(60), 0.5);
        assert_eq!(backoff.delay_with_sample(1, 0.0), Duration::from_secs(4));
        assert_eq!(backoff.delay_with_sample(1, 0.5), Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_cap(failures in 0u32..200, sample in 0.0f64..1.0, jitter in 0.0f64..1.0) {
            let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), jitter);
            let delay = backoff.delay_with_sample(failures, sample);
            prop_assert!(delay <= Duration::from_secs(30));
        }

        #[test]
        fn prop_monotone_without_jitter(failures in 1u32..60) {
            let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 0.0);
            prop_assert!(backoff.delay(failures) <= backoff.delay(failures + 1));
        }
    }
}
