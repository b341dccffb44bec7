//! Error types for parsing in blecentral-types.

use thiserror::Error;

/// Errors that can occur when parsing identifiers and payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-stack errors (those belong in blecentral-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A UUID string was neither a 16-bit short form nor a full UUID.
    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),

    /// A characteristic address was not in `service/characteristic` form.
    #[error("Invalid characteristic address '{0}': expected SERVICE/CHARACTERISTIC")]
    InvalidCharacteristicAddress(String),

    /// A hex payload had an odd length or a non-hex digit.
    #[error("Invalid hex payload: {0}")]
    InvalidHex(String),
}

/// Result type alias using blecentral-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
