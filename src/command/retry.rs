//! Exponential backoff schedules for retried operations.
//!
//! The default schedule matches the robust-run contract: up to 8 attempts
//! with delays starting at 1s and doubling, capped so a flaky SSH link is
//! given a real chance to recover without stalling a project for long.

use std::time::Duration;

/// An exponential backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPlan {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl RetryPlan {
    /// The robust-run default: 8 attempts, 1s initial delay, doubling.
    pub const ROBUST: Self = Self {
        max_attempts: 8,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
    };

    /// Log-upload schedule: 7 attempts for flaky HTTP/SSH transfers.
    pub const UPLOAD: Self = Self {
        max_attempts: 7,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
    };

    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt (0-indexed): `initial * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.initial_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// All retry delays in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|a| self.delay_for_attempt(a))
    }

    /// A schedule with negligible delays, for tests.
    #[doc(hidden)]
    pub fn fast_for_tests() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self::ROBUST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn robust_delays_double_from_one_second() {
        let plan = RetryPlan::ROBUST;
        let delays: Vec<_> = plan.delays().collect();
        assert_eq!(delays.len(), 7);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[6], Duration::from_secs(60)); // capped from 64
    }

    #[test]
    fn upload_schedule_has_seven_attempts() {
        assert_eq!(RetryPlan::UPLOAD.max_attempts, 7);
    }

    proptest! {
        /// Delays never exceed the cap and never decrease.
        #[test]
        fn delays_are_monotonic_and_capped(
            initial_ms in 1u64..2000,
            max_ms in 2000u64..120_000,
            attempts in 2u32..12,
        ) {
            let plan = RetryPlan::new(
                attempts,
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            );
            let delays: Vec<_> = plan.delays().collect();
            for w in delays.windows(2) {
                prop_assert!(w[1] >= w[0]);
            }
            for d in &delays {
                prop_assert!(*d <= Duration::from_millis(max_ms));
            }
        }

        /// The first delay is always the configured initial delay.
        #[test]
        fn first_delay_is_initial(initial_ms in 1u64..1000) {
            let plan = RetryPlan::new(
                4,
                Duration::from_millis(initial_ms),
                Duration::from_secs(600),
            );
            prop_assert_eq!(plan.delay_for_attempt(0), Duration::from_millis(initial_ms));
        }
    }
}
