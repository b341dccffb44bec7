//! Error types for blecentral-core.
//!
//! Precondition and argument errors are returned directly from the
//! controller call that caused them. Failures that happen later on the
//! transport never come back as an `Err`; they surface as
//! [`SessionEvent`](crate::events::SessionEvent)s instead.
//!
//! | Error | Returned when |
//! |-------|---------------|
//! | [`Error::InvalidArgument`] | Empty address, zero scan window |
//! | [`Error::TransportUnavailable`] | No Bluetooth adapter |
//! | [`Error::Busy`] | A scan is already running |
//! | [`Error::NotConnected`] | Read/write before the session is ready |
//! | [`Error::CharacteristicNotFound`] | Target missing from the discovered catalog |
//! | [`Error::Unsupported`] | Characteristic has no notification descriptor |
//! | [`Error::Timeout`] | A wait for a controller state elapsed |
//! | [`Error::ChannelClosed`] | The controller task has shut down |

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use blecentral_types::{CharacteristicAddress, GattStatus, ParseError};

/// Errors produced by the BLE central controller.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No Bluetooth adapter is present or it is powered off.
    #[error("Bluetooth adapter unavailable")]
    TransportUnavailable,

    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a ready session.
    #[error("Not connected to device")]
    NotConnected,

    /// A GATT operation completed with a non-success status.
    #[error("Operation '{operation}' failed: {status}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// Status reported by the transport.
        status: GattStatus,
    },

    /// The peripheral or platform does not support the request.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Characteristic is not part of the discovered catalog.
    #[error("Characteristic not found: {target}")]
    CharacteristicNotFound {
        /// The characteristic that was looked up.
        target: CharacteristicAddress,
    },

    /// Request conflicts with work already in progress.
    #[error("Busy: {0}")]
    Busy(String),

    /// Waiting for a controller state timed out.
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

    /// Bluetooth Low Energy stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The controller task is no longer running.
    #[error("Controller task is no longer running")]
    ChannelClosed,

    /// Identifier or payload parsing failed.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an operation failure with the transport status.
    pub fn operation_failed(operation: impl Into<String>, status: GattStatus) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            status,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(target: CharacteristicAddress) -> Self {
        Self::CharacteristicNotFound { target }
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_: oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

/// Result type alias using blecentral-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
