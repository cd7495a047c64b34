//! Timing configuration for the refresh engine.

use std::time::Duration;

use crate::error::{Error, Result};

/// Linear backoff step added per consecutive failure.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(5);

/// Ceiling the backoff delay saturates at.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(300);

/// How overdue a refresh may be before the device is reported unavailable.
pub const DEFAULT_UNAVAILABLE_GRACE: Duration = Duration::from_secs(60);

/// Extra time given to the sensor after its next sample is due.
pub const DEFAULT_REFRESH_SLACK: Duration = Duration::from_secs(10);

/// Smallest delay ever scheduled after a successful read.
pub const DEFAULT_MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Minimum age of cached device information before it is fetched again.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timeout for the direct lookup by identifier.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(15);

/// Duration of the fallback scan when the direct lookup misses.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// Timing knobs for one refresh engine.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use aranet_refresh::RefreshConfig;
///
/// let config = RefreshConfig::default()
///     .unavailable_grace(Duration::from_secs(120))
///     .scan_duration(Duration::from_secs(20));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Backoff step per consecutive failure.
    pub backoff_step: Duration,
    /// Maximum backoff delay.
    pub backoff_ceiling: Duration,
    /// Overdue window tolerated before marking the device unavailable.
    pub unavailable_grace: Duration,
    /// Slack added on top of the sensor's own next-sample time.
    pub refresh_slack: Duration,
    /// Floor for the delay after a successful read.
    pub min_refresh_delay: Duration,
    /// Device information TTL.
    pub metadata_ttl: Duration,
    /// Direct lookup timeout.
    pub find_timeout: Duration,
    /// Fallback scan duration.
    pub scan_duration: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            backoff_step: DEFAULT_BACKOFF_STEP,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            unavailable_grace: DEFAULT_UNAVAILABLE_GRACE,
            refresh_slack: DEFAULT_REFRESH_SLACK,
            min_refresh_delay: DEFAULT_MIN_REFRESH_DELAY,
            metadata_ttl: DEFAULT_METADATA_TTL,
            find_timeout: DEFAULT_FIND_TIMEOUT,
            scan_duration: DEFAULT_SCAN_DURATION,
        }
    }
}

impl RefreshConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backoff step.
    #[must_use]
    pub fn backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Set the backoff ceiling.
    #[must_use]
    pub fn backoff_ceiling(mut self, ceiling: Duration) -> Self {
        self.backoff_ceiling = ceiling;
        self
    }

    /// Set the unavailable grace window.
    #[must_use]
    pub fn unavailable_grace(mut self, grace: Duration) -> Self {
        self.unavailable_grace = grace;
        self
    }

    /// Set the refresh slack.
    #[must_use]
    pub fn refresh_slack(mut self, slack: Duration) -> Self {
        self.refresh_slack = slack;
        self
    }

    /// Set the minimum refresh delay.
    #[must_use]
    pub fn min_refresh_delay(mut self, delay: Duration) -> Self {
        self.min_refresh_delay = delay;
        self
    }

    /// Set the device information TTL.
    #[must_use]
    pub fn metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    /// Set the direct lookup timeout.
    #[must_use]
    pub fn find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    /// Set the fallback scan duration.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Check that the values are usable together.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("backoff_step", self.backoff_step),
            ("backoff_ceiling", self.backoff_ceiling),
            ("min_refresh_delay", self.min_refresh_delay),
            ("find_timeout", self.find_timeout),
            ("scan_duration", self.scan_duration),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be greater than zero")));
            }
        }
        if self.backoff_ceiling < self.backoff_step {
            return Err(Error::invalid_config(format!(
                "backoff_ceiling ({:?}) must not be smaller than backoff_step ({:?})",
                self.backoff_ceiling, self.backoff_step
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RefreshConfig::default();
        assert_eq!(config.backoff_step, Duration::from_secs(5));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(300));
        assert_eq!(config.unavailable_grace, Duration::from_secs(60));
        assert_eq!(config.refresh_slack, Duration::from_secs(10));
        assert_eq!(config.metadata_ttl, Duration::from_secs(86_400));
        assert_eq!(config.find_timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = RefreshConfig::new()
            .backoff_step(Duration::from_secs(2))
            .backoff_ceiling(Duration::from_secs(30))
            .metadata_ttl(Duration::ZERO);
        assert_eq!(config.backoff_step, Duration::from_secs(2));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_step() {
        let err = RefreshConfig::default()
            .backoff_step(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("backoff_step"));
    }

    #[test]
    fn test_validate_rejects_ceiling_below_step() {
        let err = RefreshConfig::default()
            .backoff_step(Duration::from_secs(10))
            .backoff_ceiling(Duration::from_secs(5))
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
