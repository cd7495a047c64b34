//! Host-visible availability and staleness reporting.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Reason shown when the device has never been reached.
pub const NEVER_SEEN_REASON: &str = "last seen: never";

/// Current availability as published to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    /// The last refresh succeeded or is not yet overdue.
    Available,
    /// The device has been overdue for longer than the grace window.
    Unavailable {
        /// Human-readable "last seen" message.
        reason: String,
    },
}

impl Availability {
    /// Whether the device is currently considered reachable.
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    /// The unavailable reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Availability::Available => None,
            Availability::Unavailable { reason } => Some(reason),
        }
    }
}

/// Tracks last contact and the availability flag for one device.
#[derive(Debug, Clone)]
pub struct AvailabilityTracker {
    last_success_at: Option<OffsetDateTime>,
    availability: Availability,
}

impl Default for AvailabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityTracker {
    /// A freshly activated device starts out available.
    pub fn new() -> Self {
        Self {
            last_success_at: None,
            availability: Availability::Available,
        }
    }

    /// Time of the last successful contact.
    pub fn last_success_at(&self) -> Option<OffsetDateTime> {
        self.last_success_at
    }

    /// Current availability.
    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    /// Whether the device is currently available.
    pub fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    /// Record a successful contact at `now`.
    pub fn record_success(&mut self, now: OffsetDateTime) {
        self.last_success_at = Some(now);
    }

    /// Mark the device available. Returns `true` if this was a transition.
    pub fn mark_available(&mut self) -> bool {
        if self.availability.is_available() {
            return false;
        }
        self.availability = Availability::Available;
        true
    }

    /// Mark the device unavailable with a "last seen" reason computed at `now`.
    ///
    /// Returns `true` if this was a transition. While already unavailable the
    /// reason is refreshed but no transition is reported.
    pub fn mark_unavailable(&mut self, now: OffsetDateTime) -> bool {
        let reason = self.last_seen_reason(now);
        let changed = self.availability.is_available();
        self.availability = Availability::Unavailable { reason };
        changed
    }

    /// The "last seen" message as of `now`.
    pub fn last_seen_reason(&self, now: OffsetDateTime) -> String {
        match self.last_success_at {
            Some(at) => format!("last seen: {}", format_relative(now - at)),
            None => NEVER_SEEN_REASON.to_string(),
        }
    }
}

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

/// Render an elapsed duration in its largest whole unit, e.g. `"3 minutes ago"`.
///
/// Anything under one second (including negative values from clock
/// adjustments) reads `"just now"`.
pub fn format_relative(elapsed: time::Duration) -> String {
    let secs = elapsed.whole_seconds();
    if secs < 1 {
        return "just now".to_string();
    }

    let units = [
        (YEAR, "year"),
        (MONTH, "month"),
        (WEEK, "week"),
        (DAY, "day"),
        (HOUR, "hour"),
        (MINUTE, "minute"),
    ];
    let (count, unit) = units
        .iter()
        .find(|(size, _)| secs >= *size)
        .map(|(size, unit)| (secs / size, *unit))
        .unwrap_or((secs, "second"));

    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs)
    }

    #[test]
    fn test_format_relative_units() {
        assert_eq!(format_relative(Duration::milliseconds(400)), "just now");
        assert_eq!(format_relative(Duration::seconds(1)), "1 second ago");
        assert_eq!(format_relative(Duration::seconds(59)), "59 seconds ago");
        assert_eq!(format_relative(Duration::seconds(60)), "1 minute ago");
        assert_eq!(format_relative(Duration::seconds(150)), "2 minutes ago");
        assert_eq!(format_relative(Duration::hours(5)), "5 hours ago");
        assert_eq!(format_relative(Duration::days(1)), "1 day ago");
        assert_eq!(format_relative(Duration::days(15)), "2 weeks ago");
        assert_eq!(format_relative(Duration::days(45)), "1 month ago");
        assert_eq!(format_relative(Duration::days(800)), "2 years ago");
    }

    #[test]
    fn test_format_relative_negative_is_just_now() {
        assert_eq!(format_relative(Duration::seconds(-30)), "just now");
    }

    #[test]
    fn test_new_tracker_is_available() {
        let tracker = AvailabilityTracker::new();
        assert!(tracker.is_available());
        assert_eq!(tracker.last_success_at(), None);
    }

    #[test]
    fn test_unavailable_before_first_success() {
        let mut tracker = AvailabilityTracker::new();
        assert!(tracker.mark_unavailable(at(100)));
        assert_eq!(tracker.availability().reason(), Some(NEVER_SEEN_REASON));
    }

    #[test]
    fn test_transitions_are_idempotent() {
        let mut tracker = AvailabilityTracker::new();
        tracker.record_success(at(0));

        assert!(!tracker.mark_available());
        assert!(tracker.mark_unavailable(at(90)));
        assert!(!tracker.mark_unavailable(at(200)));
        assert_eq!(
            tracker.availability().reason(),
            Some("last seen: 3 minutes ago")
        );
        assert!(tracker.mark_available());
        assert!(!tracker.mark_available());
    }
}
