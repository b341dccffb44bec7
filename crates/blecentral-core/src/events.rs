//! Session event system.
//!
//! Every transport outcome reaches callers as a [`SessionEvent`] on a
//! broadcast channel. The sink is optional: with none attached, events are
//! dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use blecentral_types::{CharacteristicAddress, DeviceRecord, GattStatus};

use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::machine::ControllerState;

/// Events emitted by the controller.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// A scan window closed. Devices are deduplicated by address and sorted.
    ScanCompleted { devices: Vec<DeviceRecord> },
    /// Handshake finished; the session accepts reads and writes.
    ConnectionReady { device: DeviceRecord, mtu: u16 },
    /// Handshake or link failed.
    ConnectionFailed { address: String, reason: String },
    /// The link to the peripheral is down.
    Disconnected { address: String },
    /// Notification or indication from the peripheral.
    CharacteristicChanged {
        target: CharacteristicAddress,
        value: Vec<u8>,
    },
    /// A read completed.
    CharacteristicRead {
        target: CharacteristicAddress,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// A write completed.
    CharacteristicWritten {
        target: CharacteristicAddress,
        status: GattStatus,
    },
    /// The controller moved between states.
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    /// No Bluetooth adapter was available at start-up.
    BluetoothUnavailable,
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Create a default event channel with capacity 100.
pub fn default_event_channel() -> (EventSender, EventReceiver) {
    event_channel(DEFAULT_EVENT_CAPACITY)
}

/// Optional, swappable destination for session events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<EventSender>,
}

impl EventSink {
    /// Create a sink around an optional sender.
    pub fn new(sender: Option<EventSender>) -> Self {
        Self { sender }
    }

    /// Replace the sender, returning the previous one.
    pub fn replace(&mut self, sender: Option<EventSender>) -> Option<EventSender> {
        std::mem::replace(&mut self.sender, sender)
    }

    /// Whether a sender is attached.
    pub fn is_attached(&self) -> bool {
        self.sender.is_some()
    }

    /// Send an event. Returns `true` if at least one receiver got it.
    pub fn emit(&self, event: SessionEvent) -> bool {
        match &self.sender {
            // Ignore error if no receivers
            Some(sender) => sender.send(event).is_ok(),
            None => {
                trace!(?event, "No event sink attached, dropping event");
                false
            }
        }
    }
}
