//! Platform-agnostic types for the blecentral BLE central controller.
//!
//! This crate holds the data model shared by the controller core and its
//! front ends. It has no dependency on a Bluetooth stack.
//!
//! # Features
//!
//! - Device records and advertisement observations
//! - Fully qualified characteristic addresses
//! - GATT status codes and discovered service catalogs
//! - Well-known UUID constants and 16-bit alias helpers
//!
//! # Example
//!
//! ```
//! use blecentral_types::{CharacteristicAddress, DeviceRecord, ScanResult};
//!
//! let result = ScanResult::new("AA:BB:CC:DD:EE:FF", Some("Sensor")).with_rssi(-60);
//! assert_eq!(result.device(), DeviceRecord::new("AA:BB:CC:DD:EE:FF", None));
//!
//! let target: CharacteristicAddress = "180f/2a19".parse().unwrap();
//! assert_eq!(target.to_string(), "180f/2a19");
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    CharacteristicAddress, CharacteristicProperties, ConnectionState, DeviceRecord,
    GattCharacteristic, GattService, GattStatus, ScanCallbackType, ScanResult, WriteType,
    parse_hex, to_hex,
};
pub use uuid as uuids;
