//! Multi-device management.
//!
//! [`RefreshManager`] runs one [`RefreshEngine`] task per activated device.
//! Devices share the transport and the event dispatcher but nothing mutable:
//! each engine owns its own backoff, availability and metadata state and
//! publishes a read-only [`DeviceSnapshot`] after every cycle.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::RefreshConfig;
use crate::engine::{DeviceSnapshot, RefreshEngine, RefreshHandle};
use crate::error::Result;
use crate::events::EventDispatcher;
use crate::transport::{Transport, normalize_identifier};

/// Owner of every running refresh engine.
pub struct RefreshManager {
    transport: Arc<dyn Transport>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    events: EventDispatcher,
    shutdown: CancellationToken,
    engines: RwLock<HashMap<String, RefreshHandle>>,
}

impl std::fmt::Debug for RefreshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshManager")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl RefreshManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if `config` does not validate.
    pub fn new(transport: Arc<dyn Transport>, config: RefreshConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            clock: Arc::new(SystemClock),
            events: EventDispatcher::default(),
            shutdown: CancellationToken::new(),
            engines: RwLock::new(HashMap::new()),
        })
    }

    /// Use a different clock for engines activated from now on.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish through a caller-supplied dispatcher.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Event dispatcher shared by every engine.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Start refreshing `identifier`. The first cycle runs immediately.
    ///
    /// Returns `false` if the device was already active.
    pub async fn activate(&self, identifier: &str) -> bool {
        let key = normalize_identifier(identifier);
        let mut engines = self.engines.write().await;

        if let Some(existing) = engines.get(&key)
            && !existing.is_finished()
        {
            debug!(device = identifier, "Already active");
            return false;
        }

        let engine = RefreshEngine::new(identifier, Arc::clone(&self.transport), self.config.clone())
            .with_clock(Arc::clone(&self.clock))
            .with_events(self.events.clone());
        let handle = engine.spawn(self.shutdown.child_token());
        engines.insert(key, handle);

        info!(device = identifier, "Device activated");
        true
    }

    /// Stop refreshing `identifier` and wait for its task to exit.
    ///
    /// Returns `false` if the device was not active.
    pub async fn remove(&self, identifier: &str) -> bool {
        let key = normalize_identifier(identifier);
        let handle = self.engines.write().await.remove(&key);

        match handle {
            Some(handle) => {
                handle.stop().await;
                info!(device = identifier, "Device removed");
                true
            }
            None => false,
        }
    }

    /// Latest snapshot for one device.
    pub async fn snapshot(&self, identifier: &str) -> Option<DeviceSnapshot> {
        let key = normalize_identifier(identifier);
        self.engines.read().await.get(&key).map(RefreshHandle::snapshot)
    }

    /// Latest snapshots for every active device, sorted by identifier.
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self
            .engines
            .read()
            .await
            .values()
            .map(RefreshHandle::snapshot)
            .collect();
        all.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        all
    }

    /// Number of active devices.
    pub async fn device_count(&self) -> usize {
        self.engines.read().await.len()
    }

    /// Cancel every engine and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<RefreshHandle> = self.engines.write().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        join_all(handles.into_iter().map(RefreshHandle::stop)).await;
        info!(devices = count, "All refresh engines stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::TokioClock;
    use crate::events::DeviceEvent;
    use crate::mock::{MockPeripheralBuilder, MockTransport};

    fn manager(transport: MockTransport) -> RefreshManager {
        RefreshManager::new(Arc::new(transport), RefreshConfig::default())
            .unwrap()
            .with_clock(Arc::new(TokioClock::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_is_idempotent() {
        let peripheral = MockPeripheralBuilder::new().build();
        let manager = manager(MockTransport::with_device("AA:BB", peripheral));

        assert!(manager.activate("AA:BB").await);
        assert!(!manager.activate("aa:bb").await);
        assert_eq!(manager.device_count().await, 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_runs_immediately() {
        let peripheral = MockPeripheralBuilder::new().build();
        let manager = manager(MockTransport::with_device("AA:BB", peripheral.clone()));
        let mut rx = manager.events().subscribe();

        manager.activate("AA:BB").await;
        let reading = tokio::time::timeout(Duration::from_millis(10), async {
            loop {
                if let Ok(DeviceEvent::Reading { reading, .. }) = rx.recv().await {
                    return reading;
                }
            }
        })
        .await;

        assert!(reading.is_ok(), "no reading before any time passed");
        assert_eq!(peripheral.stats().data_reads, 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stops_engine() {
        let peripheral = MockPeripheralBuilder::new().build();
        let manager = manager(MockTransport::with_device("AA:BB", peripheral.clone()));

        manager.activate("AA:BB").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.remove("AA:BB").await);
        assert!(!manager.remove("AA:BB").await);

        let reads = peripheral.stats().data_reads;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(peripheral.stats().data_reads, reads);
        assert!(manager.snapshot("AA:BB").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_sorted() {
        let transport = MockTransport::with_device("BB", MockPeripheralBuilder::new().build());
        let manager = manager(transport);

        manager.activate("BB").await;
        manager.activate("AA").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let ids: Vec<String> = manager
            .snapshots()
            .await
            .into_iter()
            .map(|s| s.identifier)
            .collect();
        assert_eq!(ids, vec!["AA".to_string(), "BB".to_string()]);
        manager.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RefreshConfig::default().backoff_step(Duration::ZERO);
        let result = RefreshManager::new(Arc::new(MockTransport::new()), config);
        assert!(result.is_err());
    }
}
