//! Bluetooth UUIDs used to talk to an Aranet4.
//!
//! These values are fixed by the sensor firmware and must match bit for bit.

use uuid::{Uuid, uuid};

// --- Sensor data services ---

/// Saf Tehnika data service for firmware before v1.2.0.
pub const SAF_TEHNIKA_SERVICE_OLD: Uuid = uuid!("f0cd1400-95da-4f4b-9ac8-aa55d312af0c");

/// Saf Tehnika data service for firmware v1.2.0 and newer.
pub const SAF_TEHNIKA_SERVICE_NEW: Uuid = uuid!("0000fce0-0000-1000-8000-00805f9b34fb");

/// Service UUIDs that identify an Aranet4, in lookup order.
///
/// Used both to pick the data service on a connected peripheral and as the
/// signature set when matching scan results.
pub const DATA_SERVICE_UUIDS: [Uuid; 2] = [SAF_TEHNIKA_SERVICE_OLD, SAF_TEHNIKA_SERVICE_NEW];

/// Detailed current-readings characteristic (13-byte payload).
pub const CURRENT_READINGS_DETAIL: Uuid = uuid!("f0cd3001-95da-4f4b-9ac8-aa55d312af0c");

// --- Device Information service ---

/// Standard Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Manufacturer name string characteristic.
pub const MANUFACTURER_NAME: Uuid = uuid!("00002a29-0000-1000-8000-00805f9b34fb");

/// Model number string characteristic.
pub const MODEL_NUMBER: Uuid = uuid!("00002a24-0000-1000-8000-00805f9b34fb");

/// Serial number string characteristic.
pub const SERIAL_NUMBER: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");

/// Hardware revision string characteristic.
pub const HARDWARE_REVISION: Uuid = uuid!("00002a27-0000-1000-8000-00805f9b34fb");

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");

/// Software revision string characteristic.
pub const SOFTWARE_REVISION: Uuid = uuid!("00002a28-0000-1000-8000-00805f9b34fb");

/// The six identity characteristics requested during a metadata refresh.
pub const DEVICE_INFO_CHARACTERISTICS: [Uuid; 6] = [
    MANUFACTURER_NAME,
    MODEL_NUMBER,
    SERIAL_NUMBER,
    HARDWARE_REVISION,
    FIRMWARE_REVISION,
    SOFTWARE_REVISION,
];

/// Returns `true` if `uuid` is one of the Aranet4 data services.
pub fn is_data_service(uuid: &Uuid) -> bool {
    DATA_SERVICE_UUIDS.contains(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_service_uuids() {
        assert_eq!(
            SAF_TEHNIKA_SERVICE_OLD.to_string(),
            "f0cd1400-95da-4f4b-9ac8-aa55d312af0c"
        );
        assert_eq!(
            SAF_TEHNIKA_SERVICE_NEW.to_string(),
            "0000fce0-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_data_characteristic_uuid() {
        assert_eq!(
            CURRENT_READINGS_DETAIL.to_string(),
            "f0cd3001-95da-4f4b-9ac8-aa55d312af0c"
        );
    }

    #[test]
    fn test_device_info_service_uuid() {
        assert_eq!(
            DEVICE_INFO_SERVICE.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_device_info_characteristics_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for uuid in DEVICE_INFO_CHARACTERISTICS {
            assert!(seen.insert(uuid), "duplicate characteristic {uuid}");
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_standard_characteristic_short_ids() {
        // 16-bit SIG assigned numbers embedded in the Bluetooth base UUID
        let short = |u: Uuid| u.as_fields().0;
        assert_eq!(short(MANUFACTURER_NAME), 0x2A29);
        assert_eq!(short(MODEL_NUMBER), 0x2A24);
        assert_eq!(short(SERIAL_NUMBER), 0x2A25);
        assert_eq!(short(HARDWARE_REVISION), 0x2A27);
        assert_eq!(short(FIRMWARE_REVISION), 0x2A26);
        assert_eq!(short(SOFTWARE_REVISION), 0x2A28);
    }

    #[test]
    fn test_is_data_service() {
        assert!(is_data_service(&SAF_TEHNIKA_SERVICE_OLD));
        assert!(is_data_service(&SAF_TEHNIKA_SERVICE_NEW));
        assert!(!is_data_service(&DEVICE_INFO_SERVICE));
    }
}
