//! GATT callback router.
//!
//! Transports report every asynchronous GATT outcome through a shared
//! [`GattCallback`]. The callback forwards each event, in arrival order, to
//! the single registered [`GattEventListener`] and drops it when no listener
//! is registered.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use blecentral_types::{CharacteristicAddress, ConnectionState, GattStatus};

/// An asynchronous GATT outcome reported by the transport.
///
/// Every variant carries the address of the peripheral it belongs to so the
/// state machine can absorb late events from a previous session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Link state changed.
    ConnectionStateChanged {
        address: String,
        status: GattStatus,
        state: ConnectionState,
    },
    /// Service discovery finished.
    ServicesDiscovered { address: String, status: GattStatus },
    /// MTU exchange finished.
    MtuChanged {
        address: String,
        mtu: u16,
        status: GattStatus,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        address: String,
        target: CharacteristicAddress,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// A characteristic write completed.
    CharacteristicWritten {
        address: String,
        target: CharacteristicAddress,
        status: GattStatus,
    },
    /// The peripheral sent a notification or indication.
    CharacteristicChanged {
        address: String,
        target: CharacteristicAddress,
        value: Vec<u8>,
    },
}

impl GattEvent {
    /// Address of the peripheral that produced this event.
    pub fn address(&self) -> &str {
        match self {
            Self::ConnectionStateChanged { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::MtuChanged { address, .. }
            | Self::CharacteristicRead { address, .. }
            | Self::CharacteristicWritten { address, .. }
            | Self::CharacteristicChanged { address, .. } => address,
        }
    }

    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::ServicesDiscovered { .. } => "services_discovered",
            Self::MtuChanged { .. } => "mtu_changed",
            Self::CharacteristicRead { .. } => "characteristic_read",
            Self::CharacteristicWritten { .. } => "characteristic_written",
            Self::CharacteristicChanged { .. } => "characteristic_changed",
        }
    }
}

/// Receiver of forwarded GATT events.
pub trait GattEventListener: Send + Sync {
    /// Handle one event. Called on the transport's thread.
    fn on_event(&self, event: GattEvent);
}

impl<F> GattEventListener for F
where
    F: Fn(GattEvent) + Send + Sync,
{
    fn on_event(&self, event: GattEvent) {
        self(event)
    }
}

/// Single-slot forwarding adapter between a transport and its listener.
#[derive(Default)]
pub struct GattCallback {
    listener: RwLock<Option<Arc<dyn GattEventListener>>>,
}

impl fmt::Debug for GattCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattCallback")
            .field("has_listener", &self.has_listener())
            .finish()
    }
}

impl GattCallback {
    /// Create a callback with no listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the listener, returning the previous one.
    pub fn set_listener(
        &self,
        listener: Option<Arc<dyn GattEventListener>>,
    ) -> Option<Arc<dyn GattEventListener>> {
        let mut slot = self.listener.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, listener)
    }

    /// Whether a listener is registered.
    pub fn has_listener(&self) -> bool {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Forward `event` to the listener, or drop it if none is registered.
    pub fn dispatch(&self, event: GattEvent) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => listener.on_event(event),
            None => trace!(kind = event.kind(), address = event.address(), "No listener, dropping GATT event"),
        }
    }
}
