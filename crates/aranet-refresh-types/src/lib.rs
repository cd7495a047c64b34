//! Payload codec and shared types for Aranet4 refresh polling.
//!
//! This crate has no I/O and no async code. It provides:
//!
//! - [`SensorReading`] and its 13-byte payload codec
//! - [`DeviceInfo`] identity strings and the [`DeviceInfoField`] mapping
//! - UUID constants for the BLE services and characteristics involved
//! - [`ParseError`] for decode failures
//!
//! # Example
//!
//! ```
//! use aranet_refresh_types::{SensorReading, ParseError};
//!
//! let err = SensorReading::from_bytes(&[0u8; 7]).unwrap_err();
//! assert_eq!(err, ParseError::InvalidLength { expected: 13, actual: 7 });
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{DeviceInfo, DeviceInfoField, SENSOR_PAYLOAD_LEN, SensorReading, decode_info_string};
pub use uuid as uuids;
