//! btleplug-backed transport.
//!
//! Every operation is wrapped in a timeout from [`ConnectionConfig`], so a
//! stalled radio surfaces as [`Error::Timeout`] and the engine treats it as
//! an ordinary failed cycle. Clones share one adapter, and discovery on it
//! goes through a [`SharedScan`] so concurrent lookups never stop each
//! other's scans.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic as BtCharacteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, Service as BtService,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::scan::{ScanRadio, SharedScan};
use crate::transport::{
    Advertisement, Characteristic, Peripheral, Service, Transport, normalize_identifier,
};

/// Default timeout for establishing a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a characteristic read.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a disconnect.
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often known peripherals are re-checked while a direct lookup scans.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Address reported by platforms that hide MAC addresses (macOS).
const ZERO_ADDRESS: &str = "00:00:00:00:00:00";

/// BLE operation timeouts.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use aranet_refresh::ble::ConnectionConfig;
///
/// // Walls between the sensor and the adapter
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(25))
///     .read_timeout(Duration::from_secs(15));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Timeout for establishing a BLE connection.
    pub connection_timeout: Duration,
    /// Timeout for service discovery after connection.
    pub discovery_timeout: Duration,
    /// Timeout for BLE read operations.
    pub read_timeout: Duration,
    /// Timeout for closing the connection.
    pub disconnect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DiscoveryFailure(DeviceNotFoundReason::NoAdapter))
}

#[async_trait]
impl ScanRadio for Adapter {
    async fn begin_discovery(&self) -> Result<()> {
        self.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn end_discovery(&self) -> Result<()> {
        self.stop_scan().await?;
        Ok(())
    }
}

/// Transport over the host's first Bluetooth adapter.
#[derive(Debug, Clone)]
pub struct BleTransport {
    scan: Arc<SharedScan<Adapter>>,
    config: ConnectionConfig,
}

impl BleTransport {
    /// Open the first adapter with default timeouts.
    pub async fn new() -> Result<Self> {
        Self::with_config(ConnectionConfig::default()).await
    }

    /// Open the first adapter with custom timeouts.
    pub async fn with_config(config: ConnectionConfig) -> Result<Self> {
        let adapter = get_adapter().await?;
        Ok(Self {
            scan: SharedScan::new(adapter),
            config,
        })
    }

    fn adapter(&self) -> &Adapter {
        self.scan.radio()
    }

    /// Search the adapter's known peripherals for `identifier`.
    async fn lookup_known(&self, identifier: &str) -> Result<Option<BleAdvertisement>> {
        let wanted = normalize_identifier(identifier);

        for peripheral in self.adapter().peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let id = format_peripheral_id(&peripheral.id());
            let address = props.address.to_string();

            let by_id = normalize_identifier(&id) == wanted;
            let by_address = address != ZERO_ADDRESS && normalize_identifier(&address) == wanted;
            if by_id || by_address {
                debug!(peripheral_id = %id, %address, "Matched known peripheral");
                return Ok(Some(self.advertisement(peripheral, &props)));
            }
        }
        Ok(None)
    }

    fn advertisement(
        &self,
        peripheral: PlatformPeripheral,
        props: &PeripheralProperties,
    ) -> BleAdvertisement {
        let identifier = peripheral_identifier(&props.address.to_string(), &peripheral.id());
        let service_uuids = props
            .services
            .iter()
            .chain(props.service_data.keys())
            .copied()
            .collect();

        BleAdvertisement {
            identifier,
            display_name: props.local_name.clone(),
            service_uuids,
            peripheral,
            config: self.config.clone(),
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn find_by_identifier(
        &self,
        identifier: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Advertisement>> {
        if let Some(adv) = self.lookup_known(identifier).await? {
            debug!("Found in adapter cache (no scan needed)");
            return Ok(Box::new(adv));
        }

        let deadline = Instant::now() + timeout;
        let lease = self.scan.acquire().await?;

        let found = loop {
            sleep(LOOKUP_POLL_INTERVAL).await;
            match self.lookup_known(identifier).await {
                Ok(Some(adv)) => break Ok(Some(adv)),
                Ok(None) if Instant::now() >= deadline => break Ok(None),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = lease.release().await {
            debug!(error = %e, "Failed to stop scan");
        }

        match found? {
            Some(adv) => Ok(Box::new(adv)),
            None => Err(Error::device_not_found(identifier)),
        }
    }

    async fn scan(&self, timeout: Duration) -> Result<Vec<Box<dyn Advertisement>>> {
        info!("Starting BLE scan for {} seconds...", timeout.as_secs());

        let lease = self.scan.acquire().await?;
        sleep(timeout).await;
        lease.release().await?;

        let mut found: Vec<Box<dyn Advertisement>> = Vec::new();
        for peripheral in self.adapter().peripherals().await? {
            match peripheral.properties().await {
                Ok(Some(props)) => found.push(Box::new(self.advertisement(peripheral, &props))),
                Ok(None) => {}
                Err(e) => debug!("Error processing peripheral: {}", e),
            }
        }

        info!("Scan complete. Saw {} peripheral(s)", found.len());
        Ok(found)
    }
}

/// An advertisement seen by the adapter.
#[derive(Debug, Clone)]
pub struct BleAdvertisement {
    identifier: String,
    display_name: Option<String>,
    service_uuids: HashSet<Uuid>,
    peripheral: PlatformPeripheral,
    config: ConnectionConfig,
}

#[async_trait]
impl Advertisement for BleAdvertisement {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    fn service_uuids(&self) -> &HashSet<Uuid> {
        &self.service_uuids
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %self.identifier))]
    async fn connect(&self) -> Result<Box<dyn Peripheral>> {
        let limit = self.config.connection_timeout;
        timeout(limit, self.peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", limit))?
            .map_err(|e| Error::connection_failed(Some(self.identifier.clone()), e.to_string()))?;

        Ok(Box::new(BlePeripheral {
            peripheral: self.peripheral.clone(),
            config: self.config.clone(),
        }))
    }
}

/// An open btleplug connection.
#[derive(Debug)]
pub struct BlePeripheral {
    peripheral: PlatformPeripheral,
    config: ConnectionConfig,
}

impl BlePeripheral {
    async fn ensure_services(&self) -> Result<()> {
        if self.peripheral.services().is_empty() {
            let limit = self.config.discovery_timeout;
            timeout(limit, self.peripheral.discover_services())
                .await
                .map_err(|_| Error::timeout("discover services", limit))??;
        }
        Ok(())
    }

    fn wrap(&self, service: BtService) -> Box<dyn Service> {
        Box::new(BleService {
            service,
            peripheral: self.peripheral.clone(),
            config: self.config.clone(),
        })
    }
}

#[async_trait]
impl Peripheral for BlePeripheral {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<Vec<Box<dyn Service>>> {
        let limit = self.config.discovery_timeout;
        timeout(limit, self.peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", limit))??;

        let services = self.peripheral.services();
        debug!("Found {} services", services.len());
        Ok(services.into_iter().map(|s| self.wrap(s)).collect())
    }

    async fn get_service(&self, uuid: Uuid) -> Result<Box<dyn Service>> {
        self.ensure_services().await?;
        let services = self.peripheral.services();
        let found = services.len();
        services
            .into_iter()
            .find(|s| s.uuid == uuid)
            .map(|s| self.wrap(s))
            .ok_or(Error::ServiceNotFound {
                expected: vec![uuid],
                found,
            })
    }

    async fn disconnect(&self) -> Result<()> {
        let limit = self.config.disconnect_timeout;
        timeout(limit, self.peripheral.disconnect())
            .await
            .map_err(|_| Error::timeout("disconnect", limit))??;
        Ok(())
    }
}

struct BleService {
    service: BtService,
    peripheral: PlatformPeripheral,
    config: ConnectionConfig,
}

#[async_trait]
impl Service for BleService {
    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    async fn discover_characteristics(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<Box<dyn Characteristic>>> {
        Ok(self
            .service
            .characteristics
            .iter()
            .filter(|c| uuids.contains(&c.uuid))
            .map(|c| {
                Box::new(BleCharacteristic {
                    characteristic: c.clone(),
                    peripheral: self.peripheral.clone(),
                    read_timeout: self.config.read_timeout,
                }) as Box<dyn Characteristic>
            })
            .collect())
    }
}

struct BleCharacteristic {
    characteristic: BtCharacteristic,
    peripheral: PlatformPeripheral,
    read_timeout: Duration,
}

#[async_trait]
impl Characteristic for BleCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let data = timeout(self.read_timeout, self.peripheral.read(&self.characteristic))
            .await
            .map_err(|_| {
                Error::timeout(
                    format!("read characteristic {}", self.characteristic.uuid),
                    self.read_timeout,
                )
            })??;
        if data.is_empty() {
            warn!(uuid = %self.characteristic.uuid, "Empty characteristic value");
        }
        Ok(data)
    }
}

/// Peripheral ID as a plain string.
///
/// macOS reports UUIDs, other platforms something address-like.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identifier to store for a peripheral: its address, or the platform ID
/// where the address is hidden.
fn peripheral_identifier(address: &str, id: &PeripheralId) -> String {
    pick_identifier(address, || format_peripheral_id(id))
}

fn pick_identifier(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == ZERO_ADDRESS {
        fallback()
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_identifier_prefers_address() {
        let id = pick_identifier("AA:BB:CC:DD:EE:FF", || unreachable!());
        assert_eq!(id, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_pick_identifier_zero_address_falls_back() {
        let id = pick_identifier(ZERO_ADDRESS, || "6F9A1C2E-0000-4B11".to_string());
        assert_eq!(id, "6F9A1C2E-0000-4B11");
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new()
            .connection_timeout(Duration::from_secs(25))
            .disconnect_timeout(Duration::from_secs(2));
        assert_eq!(config.connection_timeout, Duration::from_secs(25));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(2));
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
    }
}
