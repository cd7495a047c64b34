//! Self-scheduling BLE refresh engine for Aranet4 sensors.
//!
//! Each paired sensor gets one [`RefreshEngine`] that finds it (directly,
//! or by scanning when its address has rotated), connects, reads the
//! 13-byte current-readings payload, and schedules the next cycle from the
//! sensor's own measurement interval and sample age. Failures back off
//! linearly to a ceiling, and the device is reported unavailable only after
//! its expected reading has been overdue for a grace window.
//!
//! The Bluetooth stack sits behind the [`Transport`] traits. [`BleTransport`]
//! implements them with btleplug; [`mock::MockTransport`] implements them in
//! memory.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aranet_refresh::{BleTransport, DeviceEvent, RefreshConfig, RefreshManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let manager = RefreshManager::new(transport, RefreshConfig::default())?;
//!     let mut events = manager.events().subscribe();
//!
//!     manager.activate("AA:BB:CC:DD:EE:FF").await;
//!     while let Ok(event) = events.recv().await {
//!         if let DeviceEvent::Reading { reading, .. } = event {
//!             println!("{reading}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod availability;
pub mod backoff;
pub mod ble;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod manager;
pub mod metadata;
pub mod mock;
pub mod scan;
pub mod transport;

pub use aranet_refresh_types::{
    DeviceInfo, DeviceInfoField, ParseError, SENSOR_PAYLOAD_LEN, SensorReading, uuids,
};

pub use availability::{Availability, AvailabilityTracker, format_relative};
pub use backoff::{BackoffController, BackoffDecision};
pub use ble::{BleTransport, ConnectionConfig};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::RefreshConfig;
pub use discovery::{DiscoveryPath, PairingCandidate, pairing_candidates, resolve};
pub use engine::{
    CycleOutcome, CyclePhase, DeviceSnapshot, RefreshEngine, RefreshHandle, next_refresh_delay,
};
pub use error::{DeviceNotFoundReason, Error, Result};
pub use events::{DeviceEvent, EventDispatcher, EventReceiver, EventSender};
pub use guard::ConnectionGuard;
pub use manager::RefreshManager;
pub use metadata::{MetadataCache, MetadataRefresh};
pub use scan::{ScanLease, ScanRadio, SharedScan};
pub use transport::{Advertisement, Characteristic, Peripheral, Service, Transport};
