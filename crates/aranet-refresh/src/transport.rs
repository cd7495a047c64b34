//! Transport adapter seam.
//!
//! The refresh engine never talks to a Bluetooth stack directly. It goes
//! through these traits, which mirror the handful of operations it needs:
//! find, scan, connect, service and characteristic discovery, read, and
//! disconnect. [`crate::ble`] implements them on top of btleplug and
//! [`crate::mock`] implements them in memory for tests.
//!
//! Every operation returns [`Result`]. Timeouts are enforced by the
//! implementation, never by the engine.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Entry point into a wireless stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Look a peripheral up directly by its stored identifier.
    ///
    /// Returns [`crate::Error::DiscoveryFailure`] when nothing matches within
    /// `timeout`.
    async fn find_by_identifier(
        &self,
        identifier: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Advertisement>>;

    /// Listen for advertisements for `timeout` and return everything seen.
    async fn scan(&self, timeout: Duration) -> Result<Vec<Box<dyn Advertisement>>>;
}

/// A discoverable broadcast from a peripheral.
#[async_trait]
pub trait Advertisement: Send + Sync + fmt::Debug {
    /// Stable identifier of the advertising peripheral.
    fn identifier(&self) -> &str;

    /// Advertised local name, if any.
    fn display_name(&self) -> Option<&str>;

    /// Service UUIDs carried in the advertisement.
    fn service_uuids(&self) -> &HashSet<Uuid>;

    /// Open a connection to the advertising peripheral.
    async fn connect(&self) -> Result<Box<dyn Peripheral>>;
}

/// An open connection to a peripheral.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Whether the link is still up according to the stack.
    async fn is_connected(&self) -> bool;

    /// Discover every primary service on the peripheral.
    async fn discover_services(&self) -> Result<Vec<Box<dyn Service>>>;

    /// Get a single service by UUID.
    async fn get_service(&self, uuid: Uuid) -> Result<Box<dyn Service>>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// A GATT service on a connected peripheral.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service UUID.
    fn uuid(&self) -> Uuid;

    /// Discover the characteristics among `uuids` that this service exposes.
    ///
    /// Characteristics not present are simply absent from the result.
    async fn discover_characteristics(&self, uuids: &[Uuid])
    -> Result<Vec<Box<dyn Characteristic>>>;
}

/// A readable characteristic.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Characteristic UUID.
    fn uuid(&self) -> Uuid;

    /// Read the current value.
    async fn read(&self) -> Result<Vec<u8>>;
}

/// Whether an advertisement carries any of the given service UUIDs.
pub fn advertises_any(advertisement: &dyn Advertisement, signature: &[Uuid]) -> bool {
    let advertised = advertisement.service_uuids();
    signature.iter().any(|uuid| advertised.contains(uuid))
}

/// Whether an advertisement belongs to the peripheral with `identifier`.
///
/// Comparison ignores ASCII case, and colon separators in MAC addresses.
pub fn matches_identifier(advertisement: &dyn Advertisement, identifier: &str) -> bool {
    normalize_identifier(advertisement.identifier()) == normalize_identifier(identifier)
}

/// Canonical form of a peripheral identifier used for comparison.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("AA:BB:CC:DD:EE:FF"), "aabbccddeeff");
        assert_eq!(normalize_identifier("aabbccddeeff"), "aabbccddeeff");
        assert_eq!(
            normalize_identifier(" 6F9A1C2E-0000-4B11-8C22-ABCDEF012345 "),
            "6f9a1c2e00004b118c22abcdef012345"
        );
    }

    #[test]
    fn test_normalize_identifier_distinguishes_devices() {
        assert_ne!(
            normalize_identifier("AA:BB:CC:DD:EE:FF"),
            normalize_identifier("AA:BB:CC:DD:EE:00")
        );
    }
}
