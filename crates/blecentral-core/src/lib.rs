//! BLE central-role controller.
//!
//! This crate scans for advertising peripherals, connects to one at a time,
//! drives the GATT handshake (service discovery, notification enablement,
//! MTU exchange) and then serves characteristic reads, writes and
//! notifications over the connected session.
//!
//! # Features
//!
//! - **Timed scans**: advertisements are collected for a fixed window and
//!   reported once, deduplicated by address
//! - **Session state machine**: every transport callback is applied on a
//!   single task, so transitions are strictly ordered
//! - **Throttled commands**: control-plane calls are spaced by a settle
//!   interval to keep BLE stacks happy
//! - **Serialized GATT operations**: at most one read or write is in flight
//! - **Pluggable transports**: [`BtleplugTransport`] for real hardware,
//!   [`MockTransport`] for tests
//!
//! # Session lifecycle
//!
//! ```text
//! Idle -> Connecting -> ServicesDiscovering -> NegotiatingMtu -> Ready
//! ```
//!
//! Any failure during the handshake lands in `Failed` with a
//! [`SessionEvent::ConnectionFailed`]. A dropped link always returns to
//! `Idle` with a [`SessionEvent::Disconnected`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use blecentral_core::{BtleplugTransport, ControllerConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = BtleplugTransport::controller(ControllerConfig::default()).await?;
//!     let mut events = controller.subscribe();
//!
//!     controller.start_scan(Duration::from_secs(5)).await?;
//!     while let Ok(event) = events.recv().await {
//!         if let SessionEvent::ScanCompleted { devices } = event {
//!             for device in devices {
//!                 println!("{}", device);
//!             }
//!             break;
//!         }
//!     }
//!
//!     controller.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod callback;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod machine;
pub mod mock;
pub mod scan;
pub mod session;
pub mod transport;
pub mod util;

// Re-export types and uuid modules from blecentral-types
pub use blecentral_types::types;
pub use blecentral_types::uuid;

// Core exports
pub use adapter::{BtleplugLink, BtleplugTransport, get_adapter};
pub use callback::{GattCallback, GattEvent, GattEventListener};
pub use config::{
    ControllerConfig, DEFAULT_EVENT_CAPACITY, DEFAULT_SETTLE_INTERVAL, DEFAULT_TARGET_MTU,
    MAX_ATT_MTU, MAX_SETTLE_INTERVAL, MtuPolicy,
};
pub use controller::{BleCentralController, SessionSnapshot};
pub use dispatcher::{Command, CommandQueue};
pub use error::{Error, Result};
pub use events::{
    EventReceiver, EventSender, EventSink, SessionEvent, default_event_channel, event_channel,
};
pub use machine::{ConnectionStateMachine, ControllerState};
pub use mock::{MockCall, MockLink, MockTransport, MockTransportBuilder};
pub use scan::{DedupPolicy, DeviceList, ScanMode, ScanResultAggregator, ScanSettings, ScanSnapshot};
pub use session::{GattOp, GattOpKind, Session, SessionId};
pub use transport::{GattLink, Transport};
pub use util::{addresses_match, create_identifier, format_peripheral_id};

// Re-export from blecentral-types
pub use blecentral_types::uuid as uuids;
pub use blecentral_types::{
    CharacteristicAddress, CharacteristicProperties, ConnectionState, DeviceRecord,
    GattCharacteristic, GattService, GattStatus, ParseError, ScanCallbackType, ScanResult,
    WriteType, parse_hex, to_hex,
};
