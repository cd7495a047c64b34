//! Scoped ownership of a peripheral connection.
//!
//! A [`ConnectionGuard`] holds the link for exactly one refresh cycle. The
//! engine releases it explicitly so the outcome can be logged in order; if a
//! cycle is torn down early (cancellation, panic) the guard's `Drop` spawns
//! the disconnect instead.

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::transport::Peripheral;

/// Owns a connected [`Peripheral`] until released.
pub struct ConnectionGuard {
    peripheral: Option<Box<dyn Peripheral>>,
}

impl ConnectionGuard {
    /// Take ownership of a freshly opened connection.
    pub fn new(peripheral: Box<dyn Peripheral>) -> Self {
        Self {
            peripheral: Some(peripheral),
        }
    }

    /// Borrow the connection.
    ///
    /// Returns `None` only after [`release`](Self::release).
    pub fn peripheral(&self) -> Option<&dyn Peripheral> {
        self.peripheral.as_deref()
    }

    /// Disconnect if the link is still up.
    ///
    /// A failure is logged and returned for the record, but it never counts
    /// as a failed cycle.
    pub async fn release(mut self) -> Option<Error> {
        let peripheral = self.peripheral.take()?;

        if !peripheral.is_connected().await {
            debug!("Link already down, nothing to disconnect");
            return None;
        }

        debug!("Disconnecting");
        match peripheral.disconnect().await {
            Ok(()) => {
                info!("Disconnected");
                None
            }
            Err(e) => {
                warn!(error = %e, "Error while disconnecting");
                Some(match e {
                    Error::DisconnectFailure(_) => e,
                    other => Error::DisconnectFailure(other.to_string()),
                })
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(peripheral) = self.peripheral.take() {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    if peripheral.is_connected().await
                        && let Err(e) = peripheral.disconnect().await
                    {
                        warn!("Failed to disconnect in guard drop: {}", e);
                    }
                });
            } else {
                warn!("No tokio runtime available for disconnect in guard drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeripheralBuilder;

    #[tokio::test]
    async fn test_release_disconnects() {
        let peripheral = MockPeripheralBuilder::new().connected(true).build();
        let guard = ConnectionGuard::new(Box::new(peripheral.clone()));

        assert!(guard.release().await.is_none());
        assert_eq!(peripheral.stats().disconnects, 1);
        assert!(!peripheral.is_connected_sync());
    }

    #[tokio::test]
    async fn test_release_skips_dropped_link() {
        let peripheral = MockPeripheralBuilder::new().build();
        let guard = ConnectionGuard::new(Box::new(peripheral.clone()));

        assert!(guard.release().await.is_none());
        assert_eq!(peripheral.stats().disconnects, 0);
    }

    #[tokio::test]
    async fn test_release_reports_failure() {
        let peripheral = MockPeripheralBuilder::new().connected(true).build();
        peripheral.set_fail_disconnect(true);
        let guard = ConnectionGuard::new(Box::new(peripheral));

        let err = guard.release().await;
        assert!(matches!(err, Some(Error::DisconnectFailure(_))));
    }

    #[tokio::test]
    async fn test_drop_spawns_disconnect() {
        let peripheral = MockPeripheralBuilder::new().connected(true).build();
        drop(ConnectionGuard::new(Box::new(peripheral.clone())));

        tokio::task::yield_now().await;
        assert_eq!(peripheral.stats().disconnects, 1);
    }
}
