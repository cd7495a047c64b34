//! Error types for aranet-refresh.
//!
//! Every transport operation returns [`Result`], and the refresh engine
//! consumes all of them on a single failure path. None of these errors are
//! surfaced to the host as hard faults; the engine reschedules instead.
//!
//! # Classification
//!
//! | Error | Ends the cycle | Notes |
//! |-------|----------------|-------|
//! | [`Error::DiscoveryFailure`] | yes | Neither direct lookup nor scan found the device |
//! | [`Error::ConnectionFailed`] | yes | |
//! | [`Error::ServiceNotFound`] | yes | No data service on the peripheral |
//! | [`Error::CharacteristicMismatch`] | yes | Wrong number of data characteristics |
//! | [`Error::PayloadLengthMismatch`] | yes | Payload is not 13 bytes |
//! | [`Error::Decode`] | yes | Any other payload decode error |
//! | [`Error::Timeout`] | yes | Adapter-enforced timeout |
//! | [`Error::Bluetooth`] / [`Error::NotConnected`] | yes | Often the device walked away mid-read |
//! | [`Error::MetadataFetchFailure`] | no | Logged, the reading continues |
//! | [`Error::DisconnectFailure`] | no | Logged only |

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while refreshing an Aranet4.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the platform stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The device could not be discovered.
    #[error("Discovery failed: {0}")]
    DiscoveryFailure(DeviceNotFoundReason),

    /// Connecting to a discovered device failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// Why the connection failed.
        reason: String,
    },

    /// None of the expected services were present on the peripheral.
    #[error("Service not found: none of [{}] among {found} discovered services", format_uuids(.expected))]
    ServiceNotFound {
        /// Services that were looked for.
        expected: Vec<Uuid>,
        /// Number of services the peripheral exposed.
        found: usize,
    },

    /// The data service did not expose exactly the expected characteristics.
    #[error("Characteristic mismatch for {uuid}: expected {expected}, found {found}")]
    CharacteristicMismatch {
        /// Characteristic that was requested.
        uuid: Uuid,
        /// Number of matching characteristics expected.
        expected: usize,
        /// Number actually discovered.
        found: usize,
    },

    /// The sensor payload had the wrong size.
    #[error("Payload length mismatch: expected {expected} bytes, got {actual}")]
    PayloadLengthMismatch {
        /// Required payload size.
        expected: usize,
        /// Received payload size.
        actual: usize,
    },

    /// The sensor payload could not be decoded.
    #[error("Payload decode failed: {0}")]
    Decode(aranet_refresh_types::ParseError),

    /// Reading device identity strings failed.
    #[error("Metadata fetch failed: {0}")]
    MetadataFetchFailure(String),

    /// Releasing the connection failed.
    #[error("Disconnect failed: {0}")]
    DisconnectFailure(String),

    /// Operation attempted on a peripheral that is no longer connected.
    #[error("Not connected to device")]
    NotConnected,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reason why a device was not found.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Neither the direct lookup nor the fallback scan matched the identifier.
    NotFound {
        /// Identifier that was searched for.
        identifier: String,
    },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

fn format_uuids(uuids: &[Uuid]) -> String {
    uuids
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a discovery failure for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DiscoveryFailure(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure.
    pub fn connection_failed(device_id: Option<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            device_id,
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error terminates a refresh cycle and feeds the backoff.
    ///
    /// Metadata and disconnect failures are logged and otherwise ignored.
    pub fn is_cycle_failure(&self) -> bool {
        !matches!(
            self,
            Error::MetadataFetchFailure(_) | Error::DisconnectFailure(_)
        )
    }

    /// Whether this error looks like the link dropping out from under us.
    ///
    /// Used only to pick log verbosity; retry behaviour is the same.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::NotConnected)
            || matches!(self, Error::Bluetooth(btleplug::Error::NotConnected))
            || matches!(self, Error::Bluetooth(btleplug::Error::DeviceNotFound))
    }
}

impl From<aranet_refresh_types::ParseError> for Error {
    fn from(err: aranet_refresh_types::ParseError) -> Self {
        match err {
            aranet_refresh_types::ParseError::InvalidLength { expected, actual } => {
                Error::PayloadLengthMismatch { expected, actual }
            }
            other => Error::Decode(other),
        }
    }
}

/// Result type alias using aranet-refresh's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use aranet_refresh_types::uuids;

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found("AA:BB:CC:DD:EE:FF");
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::timeout("connect", Duration::from_secs(15));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("15s"));
    }

    #[test]
    fn test_service_not_found_lists_expected() {
        let err = Error::ServiceNotFound {
            expected: uuids::DATA_SERVICE_UUIDS.to_vec(),
            found: 3,
        };
        let text = err.to_string();
        assert!(text.contains("f0cd1400-95da-4f4b-9ac8-aa55d312af0c"));
        assert!(text.contains("0000fce0-0000-1000-8000-00805f9b34fb"));
        assert!(text.contains("3 discovered"));
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = aranet_refresh_types::ParseError::InvalidLength {
            expected: 13,
            actual: 9,
        }
        .into();
        assert!(matches!(
            err,
            Error::PayloadLengthMismatch {
                expected: 13,
                actual: 9
            }
        ));
    }

    #[test]
    fn test_decode_error_fails_cycle() {
        let parse = aranet_refresh_types::ParseError::InvalidLength {
            expected: 13,
            actual: 2,
        };
        let err = Error::Decode(parse.clone());
        assert!(err.is_cycle_failure());
        assert_eq!(err.to_string(), format!("Payload decode failed: {parse}"));
        assert!(!matches!(Error::from(parse), Error::InvalidConfig(_)));
    }

    #[test]
    fn test_cycle_failure_classification() {
        assert!(Error::device_not_found("x").is_cycle_failure());
        assert!(Error::connection_failed(None, "refused").is_cycle_failure());
        assert!(
            Error::PayloadLengthMismatch {
                expected: 13,
                actual: 0
            }
            .is_cycle_failure()
        );
        assert!(!Error::MetadataFetchFailure("boom".into()).is_cycle_failure());
        assert!(!Error::DisconnectFailure("boom".into()).is_cycle_failure());
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::NotConnected.is_disconnect());
        assert!(Error::Bluetooth(btleplug::Error::NotConnected).is_disconnect());
        assert!(!Error::timeout("read", Duration::from_secs(10)).is_disconnect());
    }

    #[test]
    fn test_device_not_found_reasons() {
        let err = Error::DiscoveryFailure(DeviceNotFoundReason::NoAdapter);
        assert!(err.to_string().contains("no Bluetooth adapter"));
    }
}
