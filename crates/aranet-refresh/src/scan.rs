//! Discovery shared between every engine on one adapter.
//!
//! BLE discovery is adapter-wide: stopping it for one lookup stops it for
//! everyone, and BlueZ rejects a second start while one is running. A
//! [`SharedScan`] counts the lookups that currently need discovery. The
//! first lease starts the radio scanning and the last one stops it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// A radio whose discovery can be switched on and off.
#[async_trait]
pub trait ScanRadio: Send + Sync + 'static {
    /// Start discovering peripherals.
    async fn begin_discovery(&self) -> Result<()>;

    /// Stop discovering peripherals.
    async fn end_discovery(&self) -> Result<()>;
}

/// Reference-counted discovery on one radio.
#[derive(Debug)]
pub struct SharedScan<R> {
    radio: R,
    users: Mutex<usize>,
}

impl<R: ScanRadio> SharedScan<R> {
    /// Wrap `radio`, which must not be scanning yet.
    pub fn new(radio: R) -> Arc<Self> {
        Arc::new(Self {
            radio,
            users: Mutex::new(0),
        })
    }

    /// The wrapped radio.
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Number of outstanding leases.
    pub async fn users(&self) -> usize {
        *self.users.lock().await
    }

    /// Keep discovery running until the returned lease is released.
    pub async fn acquire(self: &Arc<Self>) -> Result<ScanLease<R>> {
        let mut users = self.users.lock().await;
        if *users == 0 {
            debug!("Starting discovery");
            self.radio.begin_discovery().await?;
        } else {
            debug!(users = *users, "Joining running discovery");
        }
        *users += 1;

        Ok(ScanLease {
            scan: Some(Arc::clone(self)),
        })
    }

    async fn leave(&self) -> Result<()> {
        let mut users = self.users.lock().await;
        *users = users.saturating_sub(1);
        if *users == 0 {
            debug!("Stopping discovery");
            self.radio.end_discovery().await?;
        }
        Ok(())
    }
}

/// One user's claim on a [`SharedScan`].
///
/// Release it explicitly. Dropping it unreleased (a cancelled cycle) spawns
/// the release instead.
#[derive(Debug)]
pub struct ScanLease<R: ScanRadio> {
    scan: Option<Arc<SharedScan<R>>>,
}

impl<R: ScanRadio> ScanLease<R> {
    /// Give up this claim, stopping discovery if it was the last one.
    pub async fn release(mut self) -> Result<()> {
        match self.scan.take() {
            Some(scan) => scan.leave().await,
            None => Ok(()),
        }
    }
}

impl<R: ScanRadio> Drop for ScanLease<R> {
    fn drop(&mut self) {
        if let Some(scan) = self.scan.take() {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = scan.leave().await {
                        warn!("Failed to stop discovery in lease drop: {}", e);
                    }
                });
            } else {
                warn!("No tokio runtime available to stop discovery in lease drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;
    use crate::error::Error;

    /// Radio that counts calls and, like BlueZ, refuses a second start.
    #[derive(Debug, Default)]
    struct CountingRadio {
        scanning: AtomicBool,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    #[async_trait]
    impl ScanRadio for CountingRadio {
        async fn begin_discovery(&self) -> Result<()> {
            if self.scanning.swap(true, Ordering::SeqCst) {
                return Err(Error::Bluetooth(btleplug::Error::Other(
                    "Operation already in progress".into(),
                )));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn end_discovery(&self) -> Result<()> {
            self.scanning.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counts(scan: &SharedScan<CountingRadio>) -> (u32, u32, bool) {
        let radio = scan.radio();
        (
            radio.starts.load(Ordering::SeqCst),
            radio.stops.load(Ordering::SeqCst),
            radio.scanning.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn test_overlapping_leases_share_one_scan() {
        let scan = SharedScan::new(CountingRadio::default());

        let first = scan.acquire().await.unwrap();
        let second = scan.acquire().await.unwrap();
        assert_eq!(counts(&scan), (1, 0, true));
        assert_eq!(scan.users().await, 2);

        // One lookup finishing leaves the other's discovery running
        first.release().await.unwrap();
        assert_eq!(counts(&scan), (1, 0, true));

        second.release().await.unwrap();
        assert_eq!(counts(&scan), (1, 1, false));
        assert_eq!(scan.users().await, 0);
    }

    #[tokio::test]
    async fn test_sequential_leases_restart_scan() {
        let scan = SharedScan::new(CountingRadio::default());

        scan.acquire().await.unwrap().release().await.unwrap();
        scan.acquire().await.unwrap().release().await.unwrap();

        assert_eq!(counts(&scan), (2, 2, false));
    }

    #[tokio::test]
    async fn test_failed_start_takes_no_lease() {
        let scan = SharedScan::new(CountingRadio::default());
        scan.radio().scanning.store(true, Ordering::SeqCst);

        assert!(scan.acquire().await.is_err());
        assert_eq!(scan.users().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_stops_scan() {
        let scan = SharedScan::new(CountingRadio::default());
        drop(scan.acquire().await.unwrap());

        tokio::task::yield_now().await;

        assert_eq!(counts(&scan), (1, 1, false));
        assert_eq!(scan.users().await, 0);
    }
}
