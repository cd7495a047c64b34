//! Core types for Aranet4 sensor data.

use core::fmt;

use bytes::{Buf, BufMut};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::uuid as ble;

/// Exact size in bytes of the detailed current-readings payload.
pub const SENSOR_PAYLOAD_LEN: usize = 13;

/// A single decoded measurement from an Aranet4.
///
/// Produced once per successful refresh cycle and handed straight to the
/// host; it is never stored beyond the cycle that read it.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorReading {
    /// CO2 concentration in ppm.
    pub co2: u16,
    /// Temperature in degrees Celsius, rounded to one decimal place.
    pub temperature: f32,
    /// Atmospheric pressure in hPa.
    pub pressure: f32,
    /// Relative humidity percentage.
    pub humidity: u8,
    /// Battery level percentage.
    pub battery: u8,
    /// Sampling cadence reported by the sensor, in seconds.
    pub interval: u16,
    /// Seconds since the sensor captured this sample.
    pub age: u16,
}

impl SensorReading {
    /// Decode a reading from the 13-byte detailed payload.
    ///
    /// The layout is little-endian:
    /// - bytes 0-1: CO2 (u16)
    /// - bytes 2-3: Temperature (u16, divide by 20 for Celsius)
    /// - bytes 4-5: Pressure (u16, divide by 10 for hPa)
    /// - byte 6: Humidity (u8)
    /// - byte 7: Battery (u8)
    /// - byte 8: reserved
    /// - bytes 9-10: Measurement interval (u16)
    /// - bytes 11-12: Measurement age (u16)
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidLength`] unless `data` is exactly
    /// [`SENSOR_PAYLOAD_LEN`] bytes long. Longer buffers are rejected too.
    ///
    /// # Examples
    ///
    /// ```
    /// use aranet_refresh_types::SensorReading;
    ///
    /// let bytes = [0xD0, 0x07, 0x64, 0x00, 0xE8, 0x03, 0x32, 0x5A, 0x00, 0x3C, 0x00, 0x05, 0x00];
    /// let reading = SensorReading::from_bytes(&bytes).unwrap();
    /// assert_eq!(reading.co2, 2000);
    /// assert_eq!(reading.temperature, 5.0);
    /// assert_eq!(reading.interval, 60);
    /// ```
    #[must_use = "decoding returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        if data.len() != SENSOR_PAYLOAD_LEN {
            return Err(ParseError::InvalidLength {
                expected: SENSOR_PAYLOAD_LEN,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let co2 = buf.get_u16_le();
        let temp_raw = buf.get_u16_le();
        let pressure_raw = buf.get_u16_le();
        let humidity = buf.get_u8();
        let battery = buf.get_u8();
        buf.advance(1);
        let interval = buf.get_u16_le();
        let age = buf.get_u16_le();

        Ok(SensorReading {
            co2,
            temperature: temperature_from_raw(temp_raw),
            pressure: f32::from(pressure_raw) / 10.0,
            humidity,
            battery,
            interval,
            age,
        })
    }

    /// Encode this reading back into the 13-byte payload layout.
    ///
    /// Temperature and pressure are converted back to raw counts with
    /// rounding, so any reading produced by [`from_bytes`](Self::from_bytes)
    /// encodes to bytes that decode to the same values.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_bytes(&self) -> [u8; SENSOR_PAYLOAD_LEN] {
        let temp_raw = (f64::from(self.temperature) * 20.0).round().clamp(0.0, 65535.0) as u16;
        let pressure_raw = (f64::from(self.pressure) * 10.0).round().clamp(0.0, 65535.0) as u16;

        let mut out = [0u8; SENSOR_PAYLOAD_LEN];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.co2);
        buf.put_u16_le(temp_raw);
        buf.put_u16_le(pressure_raw);
        buf.put_u8(self.humidity);
        buf.put_u8(self.battery);
        buf.put_u8(0);
        buf.put_u16_le(self.interval);
        buf.put_u16_le(self.age);
        out
    }

    /// Seconds until the sensor takes its next sample.
    ///
    /// Negative or zero when the reported age has reached the interval,
    /// which happens when the device clock drifts.
    pub fn seconds_until_next_measurement(&self) -> i64 {
        i64::from(self.interval) - i64::from(self.age)
    }

    /// Human-readable measurement-interval setting, e.g. `"5 minutes"`.
    pub fn interval_setting(&self) -> String {
        format_interval_minutes(self.interval)
    }
}

/// Round `raw / 20` to one decimal place, halves going up.
fn temperature_from_raw(raw: u16) -> f32 {
    // raw / 20 * 10 == raw / 2
    ((f64::from(raw) / 2.0).round() / 10.0) as f32
}

fn format_interval_minutes(interval_secs: u16) -> String {
    if interval_secs == 60 {
        return "1 minute".to_string();
    }
    if interval_secs % 60 == 0 {
        return format!("{} minutes", interval_secs / 60);
    }
    let minutes = format!("{:.2}", f64::from(interval_secs) / 60.0);
    let minutes = minutes.trim_end_matches('0').trim_end_matches('.');
    format!("{} minutes", minutes)
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CO2 {} ppm, {:.1} °C, {:.1} hPa, {}% RH, battery {}%",
            self.co2, self.temperature, self.pressure, self.humidity, self.battery
        )
    }
}

/// Identity strings read from the standard Device Information service.
///
/// Fields that were never read stay empty. Updates always replace whole
/// field values; see [`DeviceInfo::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Manufacturer name.
    pub manufacturer: String,
    /// Model number.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Hardware revision.
    pub hardware_revision: String,
    /// Firmware version.
    pub firmware_version: String,
    /// Software version.
    pub software_version: String,
    /// Name the device advertises itself under.
    pub display_name: String,
}

impl DeviceInfo {
    /// Get the value of a single identity field.
    pub fn get(&self, field: DeviceInfoField) -> &str {
        match field {
            DeviceInfoField::Manufacturer => &self.manufacturer,
            DeviceInfoField::Model => &self.model,
            DeviceInfoField::SerialNumber => &self.serial_number,
            DeviceInfoField::HardwareRevision => &self.hardware_revision,
            DeviceInfoField::FirmwareVersion => &self.firmware_version,
            DeviceInfoField::SoftwareVersion => &self.software_version,
        }
    }

    /// Replace a single identity field.
    pub fn set(&mut self, field: DeviceInfoField, value: impl Into<String>) {
        let value = value.into();
        match field {
            DeviceInfoField::Manufacturer => self.manufacturer = value,
            DeviceInfoField::Model => self.model = value,
            DeviceInfoField::SerialNumber => self.serial_number = value,
            DeviceInfoField::HardwareRevision => self.hardware_revision = value,
            DeviceInfoField::FirmwareVersion => self.firmware_version = value,
            DeviceInfoField::SoftwareVersion => self.software_version = value,
        }
    }

    /// Apply a batch of field updates from one fetch.
    ///
    /// Fields absent from `updates` keep their current value. Returns `true`
    /// if any field changed.
    pub fn apply<I, S>(&mut self, updates: I) -> bool
    where
        I: IntoIterator<Item = (DeviceInfoField, S)>,
        S: Into<String>,
    {
        let mut changed = false;
        for (field, value) in updates {
            let value = value.into();
            if self.get(field) != value {
                self.set(field, value);
                changed = true;
            }
        }
        changed
    }
}

/// Identity fields that map one-to-one onto Device Information characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceInfoField {
    /// Manufacturer name string (0x2A29).
    Manufacturer,
    /// Model number string (0x2A24).
    Model,
    /// Serial number string (0x2A25).
    SerialNumber,
    /// Hardware revision string (0x2A27).
    HardwareRevision,
    /// Firmware revision string (0x2A26).
    FirmwareVersion,
    /// Software revision string (0x2A28).
    SoftwareVersion,
}

impl DeviceInfoField {
    /// All fields, in the order their characteristics are requested.
    pub const ALL: [DeviceInfoField; 6] = [
        DeviceInfoField::Manufacturer,
        DeviceInfoField::Model,
        DeviceInfoField::SerialNumber,
        DeviceInfoField::HardwareRevision,
        DeviceInfoField::FirmwareVersion,
        DeviceInfoField::SoftwareVersion,
    ];

    /// Look up the field stored in a given characteristic.
    pub fn from_characteristic(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.characteristic() == *uuid)
    }

    /// The characteristic UUID that carries this field.
    pub fn characteristic(&self) -> Uuid {
        match self {
            DeviceInfoField::Manufacturer => ble::MANUFACTURER_NAME,
            DeviceInfoField::Model => ble::MODEL_NUMBER,
            DeviceInfoField::SerialNumber => ble::SERIAL_NUMBER,
            DeviceInfoField::HardwareRevision => ble::HARDWARE_REVISION,
            DeviceInfoField::FirmwareVersion => ble::FIRMWARE_REVISION,
            DeviceInfoField::SoftwareVersion => ble::SOFTWARE_REVISION,
        }
    }
}

impl fmt::Display for DeviceInfoField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceInfoField::Manufacturer => "Manufacturer",
            DeviceInfoField::Model => "Model number",
            DeviceInfoField::SerialNumber => "Serial number",
            DeviceInfoField::HardwareRevision => "Hardware revision",
            DeviceInfoField::FirmwareVersion => "Firmware revision",
            DeviceInfoField::SoftwareVersion => "Software revision",
        };
        f.write_str(label)
    }
}

/// Decode an identity string characteristic.
///
/// Invalid UTF-8 sequences are replaced and trailing NUL padding is removed.
pub fn decode_info_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}
