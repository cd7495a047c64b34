//! Error types for payload decoding.

use thiserror::Error;

/// Errors that can occur when decoding data read from an Aranet4.
///
/// This error type is transport-agnostic; BLE failures live in
/// `aranet-refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer does not have the exact size of the expected layout.
    #[error("Invalid payload length: expected exactly {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required number of bytes.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },
}

/// Result type alias using [`ParseError`].
pub type ParseResult<T> = std::result::Result<T, ParseError>;
