//! In-memory transport for testing.
//!
//! [`MockTransport`] implements the [`Transport`] traits without any
//! Bluetooth hardware. Each advertised device is backed by a
//! [`MockPeripheral`] that serves a configurable 13-byte payload and
//! identity strings, counts every call made against it, and can be told to
//! fail in the ways a real radio link does.
//!
//! # Features
//!
//! - **Failure injection**: failed connects, failed or interrupted reads,
//!   failed disconnects, missing services and malformed payloads
//! - **Address rotation**: advertisements can be hidden from the direct
//!   lookup so only the fallback scan finds them
//! - **Latency simulation**: artificial connect delay, which honours paused
//!   tokio time
//!
//! # Example
//!
//! ```
//! use aranet_refresh::mock::{MockAdvertisement, MockPeripheralBuilder, MockTransport};
//! use aranet_refresh::Transport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let peripheral = MockPeripheralBuilder::new().build();
//!     let transport = MockTransport::new();
//!     transport
//!         .add_advertisement(MockAdvertisement::new("AA:BB:CC:DD:EE:FF", peripheral.clone()))
//!         .await;
//!
//!     let adv = transport
//!         .find_by_identifier("aa:bb:cc:dd:ee:ff", Duration::from_secs(1))
//!         .await
//!         .unwrap();
//!     let _link = adv.connect().await.unwrap();
//!     assert_eq!(peripheral.stats().connects, 1);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use aranet_refresh_types::{DeviceInfoField, SensorReading, uuids};

use crate::error::{Error, Result};
use crate::transport::{
    Advertisement, Characteristic, Peripheral, Service, Transport, matches_identifier,
};

/// Call counters recorded by a [`MockPeripheral`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Connection attempts, including failed ones.
    pub connects: u32,
    /// `discover_services` calls.
    pub service_discoveries: u32,
    /// `get_service` calls.
    pub get_service_calls: u32,
    /// Reads of the sensor data characteristic.
    pub data_reads: u32,
    /// Reads of identity characteristics.
    pub device_info_reads: u32,
    /// Disconnect calls.
    pub disconnects: u32,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU32,
    service_discoveries: AtomicU32,
    get_service_calls: AtomicU32,
    data_reads: AtomicU32,
    device_info_reads: AtomicU32,
    disconnects: AtomicU32,
}

struct PeripheralInner {
    connected: AtomicBool,
    data_services: Vec<Uuid>,
    data_characteristic_count: usize,
    payload: RwLock<Vec<u8>>,
    device_info: HashMap<Uuid, Vec<u8>>,
    failing_info_characteristic: Option<Uuid>,
    remaining_connect_failures: AtomicU32,
    remaining_read_failures: AtomicU32,
    disconnect_on_read: AtomicBool,
    fail_disconnect: AtomicBool,
    connect_latency_ms: AtomicU64,
    counters: Counters,
}

/// A simulated Aranet4 peripheral.
///
/// Cloning shares state, so a test can keep a handle while the engine owns
/// the connection.
#[derive(Clone)]
pub struct MockPeripheral {
    inner: Arc<PeripheralInner>,
}

impl fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("connected", &self.inner.connected.load(Ordering::Relaxed))
            .field("data_services", &self.inner.data_services)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MockPeripheral {
    /// Snapshot of the call counters.
    pub fn stats(&self) -> MockStats {
        let c = &self.inner.counters;
        MockStats {
            connects: c.connects.load(Ordering::Relaxed),
            service_discoveries: c.service_discoveries.load(Ordering::Relaxed),
            get_service_calls: c.get_service_calls.load(Ordering::Relaxed),
            data_reads: c.data_reads.load(Ordering::Relaxed),
            device_info_reads: c.device_info_reads.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
        }
    }

    /// Whether the simulated link is up.
    pub fn is_connected_sync(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Replace the raw payload served by the data characteristic.
    pub async fn set_payload(&self, payload: impl Into<Vec<u8>>) {
        *self.inner.payload.write().await = payload.into();
    }

    /// Serve an encoded reading from the data characteristic.
    pub async fn set_reading(&self, reading: &SensorReading) {
        self.set_payload(reading.to_bytes()).await;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner
            .remaining_connect_failures
            .store(count, Ordering::Relaxed);
    }

    /// Fail the next `count` data reads with a timeout.
    pub fn fail_next_reads(&self, count: u32) {
        self.inner
            .remaining_read_failures
            .store(count, Ordering::Relaxed);
    }

    /// Drop the link whenever the data characteristic is read.
    pub fn set_disconnect_on_read(&self, enabled: bool) {
        self.inner
            .disconnect_on_read
            .store(enabled, Ordering::Relaxed);
    }

    /// Make `disconnect` return an error.
    pub fn set_fail_disconnect(&self, enabled: bool) {
        self.inner.fail_disconnect.store(enabled, Ordering::Relaxed);
    }

    /// Delay every connection attempt.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.inner
            .connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    async fn connect(&self) -> Result<()> {
        self.inner.counters.connects.fetch_add(1, Ordering::Relaxed);

        let latency = self.inner.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.inner.remaining_connect_failures.load(Ordering::Relaxed) > 0 {
            self.inner
                .remaining_connect_failures
                .fetch_sub(1, Ordering::Relaxed);
            return Err(Error::connection_failed(None, "Mock connection refused"));
        }

        self.inner.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        if self.inner.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn service_uuids(&self) -> Vec<Uuid> {
        let mut all = self.inner.data_services.clone();
        if !self.inner.device_info.is_empty() || self.inner.failing_info_characteristic.is_some() {
            all.push(uuids::DEVICE_INFO_SERVICE);
        }
        all
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.check_connected()?;

        if uuid == uuids::CURRENT_READINGS_DETAIL {
            self.inner.counters.data_reads.fetch_add(1, Ordering::Relaxed);

            if self.inner.disconnect_on_read.load(Ordering::Relaxed) {
                self.inner.connected.store(false, Ordering::Relaxed);
                return Err(Error::NotConnected);
            }
            if self.inner.remaining_read_failures.load(Ordering::Relaxed) > 0 {
                self.inner
                    .remaining_read_failures
                    .fetch_sub(1, Ordering::Relaxed);
                return Err(Error::timeout(
                    format!("read characteristic {uuid}"),
                    Duration::from_secs(10),
                ));
            }
            return Ok(self.inner.payload.read().await.clone());
        }

        self.inner
            .counters
            .device_info_reads
            .fetch_add(1, Ordering::Relaxed);
        if self.inner.failing_info_characteristic == Some(uuid) {
            return Err(Error::timeout(
                format!("read characteristic {uuid}"),
                Duration::from_secs(10),
            ));
        }
        self.inner
            .device_info
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::MetadataFetchFailure(format!("no characteristic {uuid}")))
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    async fn is_connected(&self) -> bool {
        self.is_connected_sync()
    }

    async fn discover_services(&self) -> Result<Vec<Box<dyn Service>>> {
        self.inner
            .counters
            .service_discoveries
            .fetch_add(1, Ordering::Relaxed);
        self.check_connected()?;

        Ok(self
            .service_uuids()
            .into_iter()
            .map(|uuid| {
                Box::new(MockService {
                    uuid,
                    peripheral: self.clone(),
                }) as Box<dyn Service>
            })
            .collect())
    }

    async fn get_service(&self, uuid: Uuid) -> Result<Box<dyn Service>> {
        self.inner
            .counters
            .get_service_calls
            .fetch_add(1, Ordering::Relaxed);
        self.check_connected()?;

        let services = self.service_uuids();
        if uuid == uuids::DEVICE_INFO_SERVICE || services.contains(&uuid) {
            Ok(Box::new(MockService {
                uuid,
                peripheral: self.clone(),
            }))
        } else {
            Err(Error::ServiceNotFound {
                expected: vec![uuid],
                found: services.len(),
            })
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner
            .counters
            .disconnects
            .fetch_add(1, Ordering::Relaxed);
        self.inner.connected.store(false, Ordering::Relaxed);
        if self.inner.fail_disconnect.load(Ordering::Relaxed) {
            return Err(Error::DisconnectFailure("Mock disconnect failure".to_string()));
        }
        Ok(())
    }
}

struct MockService {
    uuid: Uuid,
    peripheral: MockPeripheral,
}

#[async_trait]
impl Service for MockService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn discover_characteristics(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<Box<dyn Characteristic>>> {
        self.peripheral.check_connected()?;
        let inner = &self.peripheral.inner;

        let found: Vec<Uuid> = if self.uuid == uuids::DEVICE_INFO_SERVICE {
            uuids
                .iter()
                .copied()
                .filter(|u| {
                    inner.device_info.contains_key(u)
                        || inner.failing_info_characteristic == Some(*u)
                })
                .collect()
        } else if uuids.contains(&uuids::CURRENT_READINGS_DETAIL) {
            vec![uuids::CURRENT_READINGS_DETAIL; inner.data_characteristic_count]
        } else {
            Vec::new()
        };

        Ok(found
            .into_iter()
            .map(|uuid| {
                Box::new(MockCharacteristic {
                    uuid,
                    peripheral: self.peripheral.clone(),
                }) as Box<dyn Characteristic>
            })
            .collect())
    }
}

struct MockCharacteristic {
    uuid: Uuid,
    peripheral: MockPeripheral,
}

#[async_trait]
impl Characteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn read(&self) -> Result<Vec<u8>> {
        self.peripheral.read_characteristic(self.uuid).await
    }
}

/// Builder for [`MockPeripheral`].
#[derive(Debug, Clone)]
pub struct MockPeripheralBuilder {
    data_services: Vec<Uuid>,
    data_characteristic_count: usize,
    payload: Vec<u8>,
    device_info: HashMap<Uuid, Vec<u8>>,
    failing_info_characteristic: Option<Uuid>,
    connect_failures: u32,
    connected: bool,
}

impl Default for MockPeripheralBuilder {
    fn default() -> Self {
        // CO2 800 ppm, 22.5 °C, 1013.2 hPa, 45 %, 85 %, every 300 s, 120 s old
        let reading = SensorReading {
            co2: 800,
            temperature: 22.5,
            pressure: 1013.2,
            humidity: 45,
            battery: 85,
            interval: 300,
            age: 120,
        };
        Self {
            data_services: vec![uuids::SAF_TEHNIKA_SERVICE_NEW],
            data_characteristic_count: 1,
            payload: reading.to_bytes().to_vec(),
            device_info: HashMap::new(),
            failing_info_characteristic: None,
            connect_failures: 0,
            connected: false,
        }
    }
}

impl MockPeripheralBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Data services the peripheral exposes. Empty means none.
    #[must_use]
    pub fn data_services(mut self, services: &[Uuid]) -> Self {
        self.data_services = services.to_vec();
        self
    }

    /// How many data characteristics discovery returns.
    #[must_use]
    pub fn data_characteristic_count(mut self, count: usize) -> Self {
        self.data_characteristic_count = count;
        self
    }

    /// Raw payload served by the data characteristic.
    #[must_use]
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Serve an encoded reading.
    #[must_use]
    pub fn reading(mut self, reading: &SensorReading) -> Self {
        self.payload = reading.to_bytes().to_vec();
        self
    }

    /// Expose an identity string.
    #[must_use]
    pub fn device_info_field(mut self, field: DeviceInfoField, value: &str) -> Self {
        self.device_info
            .insert(field.characteristic(), value.as_bytes().to_vec());
        self
    }

    /// Expose every identity string with typical Aranet4 values.
    #[must_use]
    pub fn full_device_info(self) -> Self {
        self.device_info_field(DeviceInfoField::Manufacturer, "SAF Tehnika")
            .device_info_field(DeviceInfoField::Model, "Aranet4")
            .device_info_field(DeviceInfoField::SerialNumber, "MOCK-12345")
            .device_info_field(DeviceInfoField::HardwareRevision, "9")
            .device_info_field(DeviceInfoField::FirmwareVersion, "v1.4.19")
            .device_info_field(DeviceInfoField::SoftwareVersion, "1.4.19")
    }

    /// Make reads of one identity characteristic fail.
    #[must_use]
    pub fn fail_device_info_read(mut self, field: DeviceInfoField) -> Self {
        self.failing_info_characteristic = Some(field.characteristic());
        self
    }

    /// Fail the first `count` connection attempts.
    #[must_use]
    pub fn connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Start with the link already up, for tests that skip `connect`.
    #[must_use]
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Build the peripheral.
    #[must_use]
    pub fn build(self) -> MockPeripheral {
        MockPeripheral {
            inner: Arc::new(PeripheralInner {
                connected: AtomicBool::new(self.connected),
                data_services: self.data_services,
                data_characteristic_count: self.data_characteristic_count,
                payload: RwLock::new(self.payload),
                device_info: self.device_info,
                failing_info_characteristic: self.failing_info_characteristic,
                remaining_connect_failures: AtomicU32::new(self.connect_failures),
                remaining_read_failures: AtomicU32::new(0),
                disconnect_on_read: AtomicBool::new(false),
                fail_disconnect: AtomicBool::new(false),
                connect_latency_ms: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }
}

/// A simulated advertisement.
#[derive(Debug, Clone)]
pub struct MockAdvertisement {
    identifier: String,
    display_name: Option<String>,
    service_uuids: HashSet<Uuid>,
    directly_findable: bool,
    peripheral: MockPeripheral,
}

impl MockAdvertisement {
    /// Advertise `peripheral` under `identifier` with the new-firmware data
    /// service UUID.
    pub fn new(identifier: &str, peripheral: MockPeripheral) -> Self {
        Self {
            identifier: identifier.to_string(),
            display_name: Some(format!("Aranet4 {:05X}", rand::random::<u32>() % 0xFFFFF)),
            service_uuids: HashSet::from([uuids::SAF_TEHNIKA_SERVICE_NEW]),
            directly_findable: true,
            peripheral,
        }
    }

    /// Set or clear the advertised name.
    #[must_use]
    pub fn with_display_name(mut self, name: Option<&str>) -> Self {
        self.display_name = name.map(str::to_string);
        self
    }

    /// Replace the advertised service UUIDs.
    #[must_use]
    pub fn with_service_uuids(mut self, uuids: &[Uuid]) -> Self {
        self.service_uuids = uuids.iter().copied().collect();
        self
    }

    /// Hide from the direct lookup, so only a scan finds it.
    #[must_use]
    pub fn scan_only(mut self) -> Self {
        self.directly_findable = false;
        self
    }

    /// The backing peripheral.
    pub fn peripheral(&self) -> &MockPeripheral {
        &self.peripheral
    }
}

#[async_trait]
impl Advertisement for MockAdvertisement {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    fn service_uuids(&self) -> &HashSet<Uuid> {
        &self.service_uuids
    }

    async fn connect(&self) -> Result<Box<dyn Peripheral>> {
        self.peripheral.connect().await?;
        Ok(Box::new(self.peripheral.clone()))
    }
}

/// A simulated radio environment.
#[derive(Debug, Default)]
pub struct MockTransport {
    advertisements: RwLock<Vec<MockAdvertisement>>,
    scan_fails: AtomicBool,
    find_calls: AtomicU32,
    scan_calls: AtomicU32,
}

impl MockTransport {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// An environment with one findable device.
    pub fn with_device(identifier: &str, peripheral: MockPeripheral) -> Self {
        Self {
            advertisements: RwLock::new(vec![MockAdvertisement::new(identifier, peripheral)]),
            ..Self::default()
        }
    }

    /// Add an advertisement.
    pub async fn add_advertisement(&self, advertisement: MockAdvertisement) {
        self.advertisements.write().await.push(advertisement);
    }

    /// Remove every advertisement, as if all devices went out of range.
    pub async fn clear_advertisements(&self) {
        self.advertisements.write().await.clear();
    }

    /// Make scans fail outright.
    pub fn set_scan_fails(&self, fails: bool) {
        self.scan_fails.store(fails, Ordering::Relaxed);
    }

    /// Number of direct lookups performed.
    pub fn find_calls(&self) -> u32 {
        self.find_calls.load(Ordering::Relaxed)
    }

    /// Number of scans performed.
    pub fn scan_calls(&self) -> u32 {
        self.scan_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn find_by_identifier(
        &self,
        identifier: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn Advertisement>> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);

        let advertisements = self.advertisements.read().await;
        if let Some(adv) = advertisements
            .iter()
            .find(|a| a.directly_findable && matches_identifier(*a, identifier))
        {
            return Ok(Box::new(adv.clone()));
        }
        Err(Error::device_not_found(identifier))
    }

    async fn scan(&self, timeout: Duration) -> Result<Vec<Box<dyn Advertisement>>> {
        self.scan_calls.fetch_add(1, Ordering::Relaxed);

        if self.scan_fails.load(Ordering::Relaxed) {
            return Err(Error::timeout("scan", timeout));
        }
        let advertisements = self.advertisements.read().await;
        Ok(advertisements
            .iter()
            .map(|a| Box::new(a.clone()) as Box<dyn Advertisement>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_read_default_payload() {
        let peripheral = MockPeripheralBuilder::new().build();
        let adv = MockAdvertisement::new("AA:BB:CC:DD:EE:FF", peripheral.clone());

        let link = adv.connect().await.unwrap();
        assert!(link.is_connected().await);

        let service = link.get_service(uuids::SAF_TEHNIKA_SERVICE_NEW).await.unwrap();
        let chars = service
            .discover_characteristics(&[uuids::CURRENT_READINGS_DETAIL])
            .await
            .unwrap();
        assert_eq!(chars.len(), 1);

        let data = chars[0].read().await.unwrap();
        let reading = SensorReading::from_bytes(&data).unwrap();
        assert_eq!(reading.co2, 800);
        assert_eq!(reading.interval, 300);
        assert_eq!(peripheral.stats().data_reads, 1);
    }

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let peripheral = MockPeripheralBuilder::new().connect_failures(2).build();
        let adv = MockAdvertisement::new("dev", peripheral.clone());

        assert!(adv.connect().await.is_err());
        assert!(adv.connect().await.is_err());
        assert!(adv.connect().await.is_ok());
        assert_eq!(peripheral.stats().connects, 3);
    }

    #[tokio::test]
    async fn test_disconnect_on_read_drops_link() {
        let peripheral = MockPeripheralBuilder::new().build();
        peripheral.set_disconnect_on_read(true);
        let adv = MockAdvertisement::new("dev", peripheral.clone());
        let link = adv.connect().await.unwrap();

        let service = link.get_service(uuids::SAF_TEHNIKA_SERVICE_NEW).await.unwrap();
        let chars = service
            .discover_characteristics(&[uuids::CURRENT_READINGS_DETAIL])
            .await
            .unwrap();

        assert!(matches!(chars[0].read().await, Err(Error::NotConnected)));
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn test_scan_only_hidden_from_direct_lookup() {
        let transport = MockTransport::new();
        transport
            .add_advertisement(
                MockAdvertisement::new("AA:BB", MockPeripheralBuilder::new().build()).scan_only(),
            )
            .await;

        assert!(
            transport
                .find_by_identifier("AA:BB", Duration::from_secs(1))
                .await
                .is_err()
        );
        let found = transport.scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(transport.find_calls(), 1);
        assert_eq!(transport.scan_calls(), 1);
    }

    #[tokio::test]
    async fn test_device_info_discovery_filters_requested() {
        let peripheral = MockPeripheralBuilder::new()
            .device_info_field(DeviceInfoField::Model, "Aranet4")
            .build();
        let link = MockAdvertisement::new("dev", peripheral)
            .connect()
            .await
            .unwrap();

        let service = link.get_service(uuids::DEVICE_INFO_SERVICE).await.unwrap();
        let chars = service
            .discover_characteristics(&uuids::DEVICE_INFO_CHARACTERISTICS)
            .await
            .unwrap();

        assert_eq!(chars.len(), 1);
        assert_eq!(chars[0].uuid(), uuids::MODEL_NUMBER);
        assert_eq!(chars[0].read().await.unwrap(), b"Aranet4");
    }
}
