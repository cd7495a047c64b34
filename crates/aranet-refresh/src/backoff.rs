//! Retry delay and unavailability policy after failed cycles.
//!
//! The delay grows linearly by one step per consecutive failure and
//! saturates at a ceiling. Once saturated the counter stops moving, so a
//! long outage never wraps back to short delays.
//!
//! Availability decays on a separate clock: the device is reported
//! unavailable only once the refresh that was expected has been overdue for
//! longer than the grace window, however many retries happened meanwhile.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use crate::availability::AvailabilityTracker;
use crate::config::RefreshConfig;

/// What the engine should do after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    /// Delay before the next cycle.
    pub delay: Duration,
    /// Consecutive failure count after this failure.
    pub failures: u32,
    /// Whether the delay was clamped to the ceiling.
    pub saturated: bool,
    /// Whether this failure flipped the device to unavailable.
    pub became_unavailable: bool,
}

/// Consecutive-failure counter and retry policy for one device.
#[derive(Debug, Clone)]
pub struct BackoffController {
    consecutive_failures: u32,
    step: Duration,
    ceiling: Duration,
    grace: Duration,
}

impl BackoffController {
    /// Create a controller from the timing configuration.
    pub fn new(config: &RefreshConfig) -> Self {
        Self {
            consecutive_failures: 0,
            step: config.backoff_step,
            ceiling: config.backoff_ceiling,
            grace: config.unavailable_grace,
        }
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The delay the next failure would produce, without recording it.
    pub fn peek_delay(&self) -> Duration {
        let candidate = self.step.saturating_mul(self.consecutive_failures.saturating_add(1));
        candidate.min(self.ceiling)
    }

    /// Record a failed cycle.
    ///
    /// `expected_next_refresh_at` is when the engine last expected a good
    /// reading. If `now` is more than the grace window past it, `tracker` is
    /// marked unavailable.
    pub fn on_failure(
        &mut self,
        now: OffsetDateTime,
        expected_next_refresh_at: OffsetDateTime,
        tracker: &mut AvailabilityTracker,
    ) -> BackoffDecision {
        let candidate = self.step.saturating_mul(self.consecutive_failures.saturating_add(1));
        let saturated = candidate > self.ceiling;
        let delay = if saturated {
            self.ceiling
        } else {
            self.consecutive_failures += 1;
            candidate
        };

        let overdue = now - expected_next_refresh_at;
        let became_unavailable = if overdue > self.grace {
            tracker.mark_unavailable(now)
        } else {
            false
        };

        debug!(
            failures = self.consecutive_failures,
            delay_secs = delay.as_secs(),
            overdue_secs = overdue.whole_seconds(),
            saturated,
            "Backoff computed"
        );

        BackoffDecision {
            delay,
            failures: self.consecutive_failures,
            saturated,
            became_unavailable,
        }
    }

    /// Record a successful cycle. Returns `true` if the device became available.
    pub fn on_success(&mut self, tracker: &mut AvailabilityTracker) -> bool {
        self.consecutive_failures = 0;
        tracker.mark_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn controller() -> BackoffController {
        BackoffController::new(&RefreshConfig::default())
    }

    #[test]
    fn test_linear_delays() {
        let mut backoff = controller();
        let mut tracker = AvailabilityTracker::new();

        let delays: Vec<u64> = (0..3)
            .map(|_| backoff.on_failure(at(0), at(0), &mut tracker).delay.as_secs())
            .collect();

        assert_eq!(delays, vec![5, 10, 15]);
        assert_eq!(backoff.consecutive_failures(), 3);
    }

    #[test]
    fn test_saturation_is_sticky() {
        let mut backoff = controller();
        let mut tracker = AvailabilityTracker::new();

        for _ in 0..60 {
            backoff.on_failure(at(0), at(0), &mut tracker);
        }
        assert_eq!(backoff.consecutive_failures(), 60);

        for _ in 0..5 {
            let decision = backoff.on_failure(at(0), at(0), &mut tracker);
            assert_eq!(decision.delay, Duration::from_secs(300));
            assert!(decision.saturated);
            assert_eq!(decision.failures, 60);
        }
    }

    #[test]
    fn test_success_resets_counter_and_availability() {
        let mut backoff = controller();
        let mut tracker = AvailabilityTracker::new();
        tracker.record_success(at(0));

        for _ in 0..10 {
            backoff.on_failure(at(500), at(0), &mut tracker);
        }
        assert!(!tracker.is_available());

        assert!(backoff.on_success(&mut tracker));
        assert_eq!(backoff.consecutive_failures(), 0);
        assert!(tracker.is_available());
        assert_eq!(backoff.peek_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_not_unavailable_within_grace() {
        let mut backoff = controller();
        let mut tracker = AvailabilityTracker::new();

        let decision = backoff.on_failure(at(60), at(0), &mut tracker);
        assert!(!decision.became_unavailable);
        assert!(tracker.is_available());

        let decision = backoff.on_failure(at(61), at(0), &mut tracker);
        assert!(decision.became_unavailable);
        assert!(!tracker.is_available());

        let decision = backoff.on_failure(at(120), at(0), &mut tracker);
        assert!(!decision.became_unavailable, "already unavailable");
    }

    #[test]
    fn test_peek_does_not_record() {
        let backoff = controller();
        assert_eq!(backoff.peek_delay(), Duration::from_secs(5));
        assert_eq!(backoff.consecutive_failures(), 0);
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(failures in 1usize..200) {
            let mut backoff = BackoffController::new(&RefreshConfig::default());
            let mut tracker = AvailabilityTracker::new();
            let now = OffsetDateTime::UNIX_EPOCH;

            let mut previous = Duration::ZERO;
            for _ in 0..failures {
                let decision = backoff.on_failure(now, now, &mut tracker);
                prop_assert!(decision.delay >= previous);
                prop_assert!(decision.delay <= Duration::from_secs(300));
                previous = decision.delay;
            }
            prop_assert!(backoff.consecutive_failures() <= 60);
        }

        #[test]
        fn success_always_resets(failures in 0usize..100) {
            let mut backoff = BackoffController::new(&RefreshConfig::default());
            let mut tracker = AvailabilityTracker::new();
            let start = OffsetDateTime::UNIX_EPOCH;
            let late = start + time::Duration::hours(1);

            for _ in 0..failures {
                backoff.on_failure(late, start, &mut tracker);
            }
            backoff.on_success(&mut tracker);

            prop_assert_eq!(backoff.consecutive_failures(), 0);
            prop_assert!(tracker.is_available());
        }
    }
}
