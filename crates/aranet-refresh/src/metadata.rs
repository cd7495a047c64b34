//! Device information cache with a re-fetch TTL.
//!
//! Identity strings barely ever change, so they are read at most once per
//! TTL. A fetch that finds no known characteristics counts as a completed
//! fetch and waits out the full TTL. A failed fetch leaves the cache alone
//! and is retried after [`FAILED_FETCH_RETRY`] (or the TTL, if shorter).

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use aranet_refresh_types::{DeviceInfo, DeviceInfoField, decode_info_string, uuids};

use crate::error::{Error, Result};
use crate::transport::Peripheral;

/// Wait after a failed fetch before trying again.
pub const FAILED_FETCH_RETRY: Duration = Duration::from_secs(3600);

/// Result of [`MetadataCache::maybe_refresh`].
#[derive(Debug)]
pub enum MetadataRefresh {
    /// The cache is younger than the TTL; nothing was requested.
    Fresh {
        /// Time until the next fetch is due.
        due_in: Duration,
    },
    /// A fetch completed and was applied.
    Updated {
        /// Whether any field actually changed.
        changed: bool,
    },
    /// The identity service exposed none of the known characteristics.
    Empty,
    /// The fetch failed. The cache is unchanged.
    Failed(Error),
}

/// Cached [`DeviceInfo`] plus the time it was last fetched.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    info: DeviceInfo,
    last_fetch_at: Option<OffsetDateTime>,
    last_failure_at: Option<OffsetDateTime>,
    ttl: Duration,
}

impl MetadataCache {
    /// Create an empty cache that will fetch on first use.
    pub fn new(ttl: Duration) -> Self {
        Self {
            info: DeviceInfo::default(),
            last_fetch_at: None,
            last_failure_at: None,
            ttl,
        }
    }

    /// Cached device information.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Time of the last completed fetch, including one that found nothing.
    pub fn last_fetch_at(&self) -> Option<OffsetDateTime> {
        self.last_fetch_at
    }

    /// Time remaining before a fetch is due, or `None` if one is due now.
    pub fn due_in(&self, now: OffsetDateTime) -> Option<Duration> {
        let after_fetch = self
            .last_fetch_at
            .and_then(|at| remaining(at, self.ttl, now));
        let after_failure = self
            .last_failure_at
            .and_then(|at| remaining(at, FAILED_FETCH_RETRY.min(self.ttl), now));
        after_fetch.max(after_failure)
    }

    /// Record the advertised name. Returns `true` if it changed.
    ///
    /// This is independent of the TTL; the name comes from the advertisement
    /// seen on every discovery.
    pub fn set_display_name(&mut self, name: &str) -> bool {
        if self.info.display_name == name {
            return false;
        }
        self.info.display_name = name.to_string();
        true
    }

    /// Fetch identity strings from `peripheral` if the TTL has elapsed.
    ///
    /// Never returns an error; a failure is reported as
    /// [`MetadataRefresh::Failed`] and the reading goes on.
    pub async fn maybe_refresh(
        &mut self,
        now: OffsetDateTime,
        peripheral: &dyn Peripheral,
    ) -> MetadataRefresh {
        if let Some(due_in) = self.due_in(now) {
            debug!(due_in_mins = due_in.as_secs() / 60, "Device info is fresh");
            return MetadataRefresh::Fresh { due_in };
        }

        info!("Refreshing device info");
        match fetch_device_info(peripheral).await {
            Ok(updates) if updates.is_empty() => {
                warn!("Device information service exposed no known characteristics");
                self.last_fetch_at = Some(now);
                self.last_failure_at = None;
                MetadataRefresh::Empty
            }
            Ok(updates) => {
                for (field, value) in &updates {
                    debug!(%field, value = %value, "Device info field");
                }
                let changed = self.info.apply(updates);
                self.last_fetch_at = Some(now);
                self.last_failure_at = None;
                MetadataRefresh::Updated { changed }
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh device info");
                self.last_failure_at = Some(now);
                MetadataRefresh::Failed(e)
            }
        }
    }
}

/// Time left of `window` measured from `since`, if any.
fn remaining(since: OffsetDateTime, window: Duration, now: OffsetDateTime) -> Option<Duration> {
    let left = time::Duration::try_from(window).ok()? - (now - since);
    if left.is_positive() {
        Duration::try_from(left).ok()
    } else {
        None
    }
}

/// Read every known identity characteristic the peripheral exposes.
///
/// All reads must succeed for the batch to be returned.
async fn fetch_device_info(peripheral: &dyn Peripheral) -> Result<Vec<(DeviceInfoField, String)>> {
    let service = peripheral
        .get_service(uuids::DEVICE_INFO_SERVICE)
        .await
        .map_err(metadata_failure)?;
    let characteristics = service
        .discover_characteristics(&uuids::DEVICE_INFO_CHARACTERISTICS)
        .await
        .map_err(metadata_failure)?;

    let mut updates = Vec::with_capacity(characteristics.len());
    for characteristic in characteristics {
        let Some(field) = DeviceInfoField::from_characteristic(&characteristic.uuid()) else {
            continue;
        };
        let data = characteristic.read().await.map_err(metadata_failure)?;
        updates.push((field, decode_info_string(&data)));
    }
    Ok(updates)
}

fn metadata_failure(err: Error) -> Error {
    match err {
        Error::MetadataFetchFailure(_) => err,
        other => Error::MetadataFetchFailure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeripheral, MockPeripheralBuilder};

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    const DAY: Duration = Duration::from_secs(86_400);

    fn peripheral() -> MockPeripheral {
        MockPeripheralBuilder::new()
            .device_info_field(DeviceInfoField::Manufacturer, "SAF Tehnika")
            .device_info_field(DeviceInfoField::Model, "Aranet4")
            .device_info_field(DeviceInfoField::FirmwareVersion, "v1.4.19\0")
            .connected(true)
            .build()
    }

    #[tokio::test]
    async fn test_first_refresh_fetches() {
        let mut cache = MetadataCache::new(DAY);
        let peripheral = peripheral();

        let outcome = cache.maybe_refresh(at(0), &peripheral).await;

        assert!(matches!(outcome, MetadataRefresh::Updated { changed: true }));
        assert_eq!(cache.info().manufacturer, "SAF Tehnika");
        assert_eq!(cache.info().firmware_version, "v1.4.19");
        assert_eq!(cache.last_fetch_at(), Some(at(0)));
        assert_eq!(peripheral.stats().device_info_reads, 3);
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_transport() {
        let mut cache = MetadataCache::new(DAY);
        let peripheral = peripheral();
        cache.maybe_refresh(at(0), &peripheral).await;

        let outcome = cache.maybe_refresh(at(3600), &peripheral).await;

        match outcome {
            MetadataRefresh::Fresh { due_in } => assert_eq!(due_in, DAY - Duration::from_secs(3600)),
            other => panic!("expected Fresh, got {other:?}"),
        }
        assert_eq!(peripheral.stats().get_service_calls, 1);
    }

    #[tokio::test]
    async fn test_refetch_after_ttl() {
        let mut cache = MetadataCache::new(DAY);
        let peripheral = peripheral();
        cache.maybe_refresh(at(0), &peripheral).await;

        let outcome = cache.maybe_refresh(at(86_400), &peripheral).await;

        assert!(matches!(outcome, MetadataRefresh::Updated { changed: false }));
        assert_eq!(cache.last_fetch_at(), Some(at(86_400)));
    }

    #[tokio::test]
    async fn test_empty_service_waits_out_ttl() {
        let mut cache = MetadataCache::new(DAY);
        let peripheral = MockPeripheralBuilder::new().connected(true).build();

        let outcome = cache.maybe_refresh(at(0), &peripheral).await;
        assert!(matches!(outcome, MetadataRefresh::Empty));
        assert_eq!(cache.last_fetch_at(), Some(at(0)));
        assert_eq!(cache.info(), &DeviceInfo::default());

        let outcome = cache.maybe_refresh(at(3600), &peripheral).await;
        assert!(matches!(outcome, MetadataRefresh::Fresh { .. }));
        assert_eq!(peripheral.stats().get_service_calls, 1);
    }

    #[tokio::test]
    async fn test_read_failure_is_all_or_nothing() {
        let mut cache = MetadataCache::new(DAY);
        let peripheral = MockPeripheralBuilder::new()
            .device_info_field(DeviceInfoField::Manufacturer, "SAF Tehnika")
            .device_info_field(DeviceInfoField::SerialNumber, "12345")
            .fail_device_info_read(DeviceInfoField::SerialNumber)
            .connected(true)
            .build();

        let outcome = cache.maybe_refresh(at(0), &peripheral).await;

        assert!(matches!(
            outcome,
            MetadataRefresh::Failed(Error::MetadataFetchFailure(_))
        ));
        assert_eq!(cache.info().manufacturer, "");
        assert_eq!(cache.last_fetch_at(), None);
    }

    #[tokio::test]
    async fn test_failed_fetch_retries_after_delay() {
        let mut cache = MetadataCache::new(DAY);
        let peripheral = MockPeripheralBuilder::new()
            .device_info_field(DeviceInfoField::Manufacturer, "SAF Tehnika")
            .fail_device_info_read(DeviceInfoField::Manufacturer)
            .connected(true)
            .build();
        cache.maybe_refresh(at(0), &peripheral).await;

        let outcome = cache.maybe_refresh(at(60), &peripheral).await;
        match outcome {
            MetadataRefresh::Fresh { due_in } => {
                assert_eq!(due_in, FAILED_FETCH_RETRY - Duration::from_secs(60))
            }
            other => panic!("expected Fresh, got {other:?}"),
        }
        assert_eq!(peripheral.stats().get_service_calls, 1);

        let outcome = cache.maybe_refresh(at(3600), &peripheral).await;
        assert!(matches!(outcome, MetadataRefresh::Failed(_)));
        assert_eq!(peripheral.stats().get_service_calls, 2);
    }

    #[tokio::test]
    async fn test_success_clears_failure_delay() {
        let mut cache = MetadataCache::new(Duration::from_secs(600));
        let failing = MockPeripheralBuilder::new()
            .device_info_field(DeviceInfoField::Model, "Aranet4")
            .fail_device_info_read(DeviceInfoField::Model)
            .connected(true)
            .build();
        cache.maybe_refresh(at(0), &failing).await;

        // The retry delay is capped by the TTL
        assert_eq!(cache.due_in(at(0)), Some(Duration::from_secs(600)));

        let outcome = cache.maybe_refresh(at(600), &peripheral()).await;
        assert!(matches!(outcome, MetadataRefresh::Updated { changed: true }));
        assert_eq!(cache.due_in(at(600)), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_display_name_change() {
        let mut cache = MetadataCache::new(DAY);
        assert!(cache.set_display_name("Aranet4 1A2B3"));
        assert!(!cache.set_display_name("Aranet4 1A2B3"));
        assert_eq!(cache.info().display_name, "Aranet4 1A2B3");
    }

    #[test]
    fn test_zero_ttl_is_always_due() {
        let mut cache = MetadataCache::new(Duration::ZERO);
        cache.last_fetch_at = Some(at(0));
        assert_eq!(cache.due_in(at(0)), None);
    }
}
