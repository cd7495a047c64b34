//! Per-device refresh engine.
//!
//! One engine owns everything about one sensor: its backoff counter,
//! availability, cached identity strings, and the time its next reading is
//! expected. A cycle runs
//!
//! ```text
//! Scheduled -> Connecting -> DiscoveringServices -> RefreshingMetadata
//!           -> ReadingCharacteristic -> Decoding -> Publishing -> Scheduled
//! ```
//!
//! and any failure on the way goes to `Backoff` and then back to
//! `Scheduled`. Cycles are strictly self-chained: the end of one cycle arms
//! the timer for the next, so two cycles for the same device never overlap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aranet_refresh_types::{DeviceInfo, SensorReading, uuids};

use crate::availability::{Availability, AvailabilityTracker};
use crate::backoff::{BackoffController, BackoffDecision};
use crate::clock::{Clock, SystemClock};
use crate::config::RefreshConfig;
use crate::discovery;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventDispatcher};
use crate::guard::ConnectionGuard;
use crate::metadata::{MetadataCache, MetadataRefresh};
use crate::transport::{Peripheral, Transport};

/// Where a refresh cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Waiting for the next cycle.
    Scheduled,
    /// Resolving the advertisement and opening the link.
    Connecting,
    /// Looking for the data service.
    DiscoveringServices,
    /// Reading identity strings.
    RefreshingMetadata,
    /// Reading the sensor payload.
    ReadingCharacteristic,
    /// Decoding the payload.
    Decoding,
    /// Publishing the reading.
    Publishing,
    /// Waiting out a retry delay.
    Backoff,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Scheduled => "scheduled",
            CyclePhase::Connecting => "connecting",
            CyclePhase::DiscoveringServices => "discovering services",
            CyclePhase::RefreshingMetadata => "refreshing metadata",
            CyclePhase::ReadingCharacteristic => "reading characteristic",
            CyclePhase::Decoding => "decoding",
            CyclePhase::Publishing => "publishing",
            CyclePhase::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Read-only view of an engine's state, published after every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Peripheral identifier.
    pub identifier: String,
    /// Current phase.
    pub phase: CyclePhase,
    /// Host-visible availability.
    pub availability: Availability,
    /// Consecutive failed cycles.
    pub consecutive_failures: u32,
    /// Last successful contact.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    /// When the engine expects the next good reading.
    #[serde(with = "time::serde::rfc3339")]
    pub expected_next_refresh_at: OffsetDateTime,
    /// Last successful identity fetch.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_metadata_fetch_at: Option<OffsetDateTime>,
    /// Cached identity strings.
    pub device_info: DeviceInfo,
    /// Last published measurement-interval setting.
    pub interval_setting: Option<String>,
}

/// Result of a single cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// A reading was published.
    Success {
        /// The decoded reading.
        reading: SensorReading,
        /// Delay until the next cycle.
        next_in: Duration,
    },
    /// The cycle failed and a retry was scheduled.
    Failure {
        /// What went wrong.
        error: Error,
        /// Phase the failure happened in.
        phase: CyclePhase,
        /// Backoff decision for the retry.
        decision: BackoffDecision,
    },
}

impl CycleOutcome {
    /// Delay until the next cycle should start.
    pub fn delay(&self) -> Duration {
        match self {
            CycleOutcome::Success { next_in, .. } => *next_in,
            CycleOutcome::Failure { decision, .. } => decision.delay,
        }
    }

    /// Whether the cycle produced a reading.
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success { .. })
    }
}

/// Delay before the next cycle after a successful read.
///
/// The sensor reports its own cadence and the age of the sample just read,
/// so the next sample is due in `interval - age` seconds; `slack` is added
/// on top. The result never drops below `floor`.
pub fn next_refresh_delay(reading: &SensorReading, slack: Duration, floor: Duration) -> Duration {
    let until_next = reading.seconds_until_next_measurement();
    let secs = until_next.saturating_add(slack.as_secs() as i64);
    let delay = Duration::from_secs(secs.max(0) as u64).max(floor);

    if until_next <= 0 {
        warn!(
            interval = reading.interval,
            age = reading.age,
            delay_secs = delay.as_secs(),
            "Measurement age is not below the interval, possible device clock skew"
        );
    }
    delay
}

struct CycleFailure {
    phase: CyclePhase,
    error: Error,
    link_lost: bool,
}

/// The refresh state machine for one device.
pub struct RefreshEngine {
    identifier: String,
    transport: Arc<dyn Transport>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    events: EventDispatcher,
    backoff: BackoffController,
    availability: AvailabilityTracker,
    metadata: MetadataCache,
    expected_next_refresh_at: OffsetDateTime,
    phase: CyclePhase,
    interval_setting: Option<String>,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl fmt::Debug for RefreshEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshEngine")
            .field("identifier", &self.identifier)
            .field("phase", &self.phase)
            .field("consecutive_failures", &self.backoff.consecutive_failures())
            .field("availability", self.availability.availability())
            .finish()
    }
}

impl RefreshEngine {
    /// Create an engine for `identifier` using the system clock.
    ///
    /// The device counts as activated now: the first overdue window starts
    /// at construction time.
    pub fn new(
        identifier: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: RefreshConfig,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let identifier = identifier.into();
        let now = clock.now();
        let backoff = BackoffController::new(&config);
        let metadata = MetadataCache::new(config.metadata_ttl);
        let availability = AvailabilityTracker::new();

        let (snapshot, _) = watch::channel(DeviceSnapshot {
            identifier: identifier.clone(),
            phase: CyclePhase::Scheduled,
            availability: availability.availability().clone(),
            consecutive_failures: 0,
            last_success_at: None,
            expected_next_refresh_at: now,
            last_metadata_fetch_at: None,
            device_info: DeviceInfo::default(),
            interval_setting: None,
        });

        Self {
            identifier,
            transport,
            config,
            clock,
            events: EventDispatcher::default(),
            backoff,
            availability,
            metadata,
            expected_next_refresh_at: now,
            phase: CyclePhase::Scheduled,
            interval_setting: None,
            snapshot,
        }
    }

    /// Use a different clock. Resets the activation time to the new clock's now.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.expected_next_refresh_at = clock.now();
        self.clock = clock;
        self.publish_snapshot();
        self
    }

    /// Publish through a shared dispatcher.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Peripheral identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Current phase.
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Consecutive failed cycles.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.consecutive_failures()
    }

    /// Host-visible availability.
    pub fn availability(&self) -> &Availability {
        self.availability.availability()
    }

    /// Last successful contact.
    pub fn last_success_at(&self) -> Option<OffsetDateTime> {
        self.availability.last_success_at()
    }

    /// When the next good reading is expected.
    pub fn expected_next_refresh_at(&self) -> OffsetDateTime {
        self.expected_next_refresh_at
    }

    /// Cached identity strings.
    pub fn device_info(&self) -> &DeviceInfo {
        self.metadata.info()
    }

    /// Event dispatcher the engine publishes to.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Watch the snapshot published after every cycle.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current state as a snapshot.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            identifier: self.identifier.clone(),
            phase: self.phase,
            availability: self.availability.availability().clone(),
            consecutive_failures: self.backoff.consecutive_failures(),
            last_success_at: self.availability.last_success_at(),
            expected_next_refresh_at: self.expected_next_refresh_at,
            last_metadata_fetch_at: self.metadata.last_fetch_at(),
            device_info: self.metadata.info().clone(),
            interval_setting: self.interval_setting.clone(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.snapshot());
    }

    /// Run one full cycle and return what should happen next.
    ///
    /// Never returns an error: every failure is folded into
    /// [`CycleOutcome::Failure`] with a retry delay.
    #[tracing::instrument(level = "info", skip(self), fields(device = %self.identifier))]
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let outcome = match self.attempt().await {
            Ok(reading) => self.on_success(reading),
            Err(failure) => self.on_failure(failure),
        };
        self.publish_snapshot();
        outcome
    }

    async fn attempt(&mut self) -> std::result::Result<SensorReading, CycleFailure> {
        self.phase = CyclePhase::Connecting;

        let resolved = discovery::resolve(
            self.transport.as_ref(),
            &self.identifier,
            self.config.find_timeout,
            self.config.scan_duration,
        )
        .await
        .map_err(|error| self.failure(error, false))?;

        let advertisement = resolved.advertisement;
        if let Some(name) = advertisement.display_name()
            && self.metadata.set_display_name(name)
        {
            info!(display_name = name, "Display name updated");
            self.events.send(DeviceEvent::DeviceInfoUpdated {
                device: self.identifier.clone(),
                info: self.metadata.info().clone(),
            });
        }

        info!(path = %resolved.path, "Device found, connecting");
        let link = advertisement
            .connect()
            .await
            .map_err(|error| self.failure(error, false))?;
        info!("Connected");

        let guard = ConnectionGuard::new(link);
        let result = match guard.peripheral() {
            Some(peripheral) => match self.read_with(peripheral).await {
                Ok(reading) => Ok(reading),
                Err(error) => {
                    let link_lost = error.is_disconnect() || !peripheral.is_connected().await;
                    Err(self.failure(error, link_lost))
                }
            },
            None => Err(self.failure(Error::NotConnected, true)),
        };

        // Logged inside release; never feeds the backoff.
        let _ = guard.release().await;
        result
    }

    async fn read_with(&mut self, peripheral: &dyn Peripheral) -> Result<SensorReading> {
        self.phase = CyclePhase::DiscoveringServices;
        let services = peripheral.discover_services().await?;
        let found = services.len();
        let service = services
            .into_iter()
            .find(|s| uuids::is_data_service(&s.uuid()))
            .ok_or_else(|| Error::ServiceNotFound {
                expected: uuids::DATA_SERVICE_UUIDS.to_vec(),
                found,
            })?;
        debug!(service = %service.uuid(), "Data service found");

        self.phase = CyclePhase::RefreshingMetadata;
        let now = self.clock.now();
        match self.metadata.maybe_refresh(now, peripheral).await {
            MetadataRefresh::Updated { changed: true } => {
                self.events.send(DeviceEvent::DeviceInfoUpdated {
                    device: self.identifier.clone(),
                    info: self.metadata.info().clone(),
                });
            }
            MetadataRefresh::Updated { changed: false } => debug!("Device info unchanged"),
            MetadataRefresh::Fresh { .. } | MetadataRefresh::Empty | MetadataRefresh::Failed(_) => {}
        }

        self.phase = CyclePhase::ReadingCharacteristic;
        let characteristics = service
            .discover_characteristics(&[uuids::CURRENT_READINGS_DETAIL])
            .await?;
        if characteristics.len() != 1 {
            return Err(Error::CharacteristicMismatch {
                uuid: uuids::CURRENT_READINGS_DETAIL,
                expected: 1,
                found: characteristics.len(),
            });
        }
        let data = characteristics[0].read().await?;

        self.phase = CyclePhase::Decoding;
        Ok(SensorReading::from_bytes(&data)?)
    }

    fn failure(&self, error: Error, link_lost: bool) -> CycleFailure {
        CycleFailure {
            phase: self.phase,
            error,
            link_lost,
        }
    }

    fn on_success(&mut self, reading: SensorReading) -> CycleOutcome {
        self.phase = CyclePhase::Publishing;
        let now = self.clock.now();

        self.availability.record_success(now);
        if self.backoff.on_success(&mut self.availability) {
            info!("Device available again");
            self.events.send(DeviceEvent::AvailabilityChanged {
                device: self.identifier.clone(),
                available: true,
                reason: None,
            });
        }

        info!(%reading, "Updating device values");
        self.events.send(DeviceEvent::Reading {
            device: self.identifier.clone(),
            reading,
        });

        let text = reading.interval_setting();
        if self.interval_setting.as_deref() != Some(text.as_str()) {
            self.interval_setting = Some(text.clone());
            self.events.send(DeviceEvent::IntervalSetting {
                device: self.identifier.clone(),
                text,
            });
        }

        let next_in = next_refresh_delay(
            &reading,
            self.config.refresh_slack,
            self.config.min_refresh_delay,
        );
        self.expected_next_refresh_at = now + next_in;
        self.phase = CyclePhase::Scheduled;

        info!(
            interval = reading.interval,
            age = reading.age,
            delay_secs = next_in.as_secs(),
            "Refresh rate is {}s, sensor reading age is {}s, refreshing in {}s",
            reading.interval,
            reading.age,
            next_in.as_secs()
        );

        CycleOutcome::Success { reading, next_in }
    }

    fn on_failure(&mut self, failure: CycleFailure) -> CycleOutcome {
        let CycleFailure {
            phase,
            error,
            link_lost,
        } = failure;

        if link_lost {
            info!(%phase, error = %error, "Device disconnected while attempting to read data");
        } else {
            warn!(%phase, error = %error, "Refresh failed");
        }

        let now = self.clock.now();
        let decision =
            self.backoff
                .on_failure(now, self.expected_next_refresh_at, &mut self.availability);

        if decision.became_unavailable {
            let reason = self.availability.availability().reason().map(str::to_string);
            warn!(reason = ?reason, "Marking device unavailable");
            self.events.send(DeviceEvent::AvailabilityChanged {
                device: self.identifier.clone(),
                available: false,
                reason,
            });
        }

        self.events.send(DeviceEvent::CycleFailed {
            device: self.identifier.clone(),
            error: error.to_string(),
            retry_in_secs: decision.delay.as_secs(),
            failures: decision.failures,
        });

        info!(
            delay_secs = decision.delay.as_secs(),
            failures = decision.failures,
            "Retrying in {}s",
            decision.delay.as_secs()
        );
        self.phase = CyclePhase::Backoff;

        CycleOutcome::Failure {
            error,
            phase,
            decision,
        }
    }

    /// Start the self-scheduling loop on the current runtime.
    ///
    /// The first cycle runs immediately. Cancelling `cancel` aborts an
    /// in-flight cycle (its connection is released by the guard) and stops
    /// the loop before it arms another timer.
    pub fn spawn(self, cancel: CancellationToken) -> RefreshHandle {
        let snapshot = self.subscribe_snapshot();
        let identifier = self.identifier.clone();
        let task = tokio::spawn(self.run(cancel.clone()));
        RefreshHandle {
            identifier,
            cancel,
            snapshot,
            task,
        }
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(device = %self.identifier, "Refresh engine started");

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.run_cycle() => outcome,
            };

            // A teardown may have raced the end of the cycle.
            if cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(outcome.delay()) => {}
            }
        }

        self.phase = CyclePhase::Scheduled;
        self.publish_snapshot();
        info!(device = %self.identifier, "Refresh engine stopped");
    }
}

/// Handle to a running engine task.
#[derive(Debug)]
pub struct RefreshHandle {
    identifier: String,
    cancel: CancellationToken,
    snapshot: watch::Receiver<DeviceSnapshot>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Peripheral identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Whether the engine task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(device = %self.identifier, error = %e, "Refresh task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(interval: u16, age: u16) -> SensorReading {
        SensorReading {
            co2: 600,
            temperature: 21.0,
            pressure: 1000.0,
            humidity: 40,
            battery: 90,
            interval,
            age,
        }
    }

    const SLACK: Duration = Duration::from_secs(10);
    const FLOOR: Duration = Duration::from_secs(5);

    #[test]
    fn test_next_refresh_delay() {
        assert_eq!(
            next_refresh_delay(&reading(60, 5), SLACK, FLOOR),
            Duration::from_secs(65)
        );
        assert_eq!(
            next_refresh_delay(&reading(300, 120), SLACK, FLOOR),
            Duration::from_secs(190)
        );
    }

    #[test]
    fn test_next_refresh_delay_with_skew() {
        // age == interval still leaves the slack
        assert_eq!(
            next_refresh_delay(&reading(60, 60), SLACK, FLOOR),
            Duration::from_secs(10)
        );
        // age far past interval is clamped to the floor
        assert_eq!(
            next_refresh_delay(&reading(60, 600), SLACK, FLOOR),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_cycle_phase_display() {
        assert_eq!(CyclePhase::ReadingCharacteristic.to_string(), "reading characteristic");
        assert_eq!(
            serde_json::to_string(&CyclePhase::DiscoveringServices).unwrap(),
            "\"discovering_services\""
        );
    }
}
