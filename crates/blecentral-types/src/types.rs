//! Core types exchanged between the scanner, the session state machine and
//! its callers.

use core::fmt;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::uuid::{CLIENT_CHARACTERISTIC_CONFIG, parse_uuid, to_short};

/// A discovered peripheral as presented to callers.
///
/// Identity is the transport address alone: two records with the same
/// address are equal no matter what name they carry. Records are created
/// from the first scan result for an address and are never mutated.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceRecord {
    /// Transport address (MAC address on Linux/Windows, a UUID on macOS).
    pub address: String,
    /// Advertised local name, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
}

impl DeviceRecord {
    /// Create a record with an optional display name.
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Display name, falling back to the address when no usable name was
    /// advertised.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.address,
        }
    }
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DeviceRecord {}

impl Hash for DeviceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for DeviceRecord {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceRecord {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(f, "{} ({})", name, self.address),
            _ => write!(f, "{}", self.address),
        }
    }
}

/// How a regular scan result was delivered by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ScanCallbackType {
    /// Every advertisement that matches the filter.
    AllMatches,
    /// Only the first advertisement seen for a device.
    FirstMatch,
    /// The device stopped advertising.
    MatchLost,
}

/// A single advertisement observation.
///
/// Equality and hashing cover the whole value, so two observations of the
/// same device with different signal strength are different results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScanResult {
    /// Transport address of the advertiser.
    pub address: String,
    /// Advertised local name.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    /// Received signal strength in dBm.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub rssi: Option<i16>,
    /// Advertised transmit power in dBm.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub tx_power: Option<i16>,
    /// Manufacturer specific data keyed by company identifier.
    #[cfg_attr(feature = "serde", serde(default))]
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    #[cfg_attr(feature = "serde", serde(default))]
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Advertised service UUIDs.
    #[cfg_attr(feature = "serde", serde(default))]
    pub services: Vec<Uuid>,
}

impl ScanResult {
    /// Create a result carrying only an address and a name.
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            ..Default::default()
        }
    }

    /// Set the RSSI.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add a manufacturer data entry.
    #[must_use]
    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    /// Add an advertised service UUID.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.push(uuid);
        self
    }

    /// The device record this observation belongs to.
    pub fn device(&self) -> DeviceRecord {
        DeviceRecord::new(self.address.clone(), self.name.clone())
    }
}

/// Fully qualified characteristic: owning service plus characteristic UUID.
///
/// Displayed and parsed as `service/characteristic`, with SIG-assigned
/// UUIDs in their 16-bit short form.
///
/// ```
/// use blecentral_types::CharacteristicAddress;
/// use blecentral_types::uuid::{BATTERY_LEVEL, BATTERY_SERVICE};
///
/// let target: CharacteristicAddress = "180f/2a19".parse().unwrap();
/// assert_eq!(target, CharacteristicAddress::new(BATTERY_SERVICE, BATTERY_LEVEL));
/// assert_eq!(target.to_string(), "180f/2a19");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicAddress {
    /// Service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

impl CharacteristicAddress {
    /// Create an address from its two UUIDs.
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

fn fmt_uuid(uuid: &Uuid, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match to_short(uuid) {
        Some(short) => write!(f, "{:04x}", short),
        None => write!(f, "{}", uuid),
    }
}

impl fmt::Display for CharacteristicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_uuid(&self.service, f)?;
        f.write_str("/")?;
        fmt_uuid(&self.characteristic, f)
    }
}

impl FromStr for CharacteristicAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let (service, characteristic) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidCharacteristicAddress(s.to_string()))?;
        Ok(Self::new(parse_uuid(service)?, parse_uuid(characteristic)?))
    }
}

/// Status code reported by the transport for a GATT operation.
///
/// Values below `0x100` are ATT error codes; `FAILURE` is the generic
/// stack-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct GattStatus(pub u16);

impl GattStatus {
    /// Operation completed successfully.
    pub const SUCCESS: Self = Self(0x00);
    /// Characteristic is not readable.
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    /// Characteristic is not writable.
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    /// Link is not authenticated.
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    /// The peer does not support the request.
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    /// Read or write offset past the attribute end.
    pub const INVALID_OFFSET: Self = Self(0x07);
    /// Value length is invalid for the attribute.
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(0x0d);
    /// Link is not encrypted.
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x0f);
    /// Remote device is congested.
    pub const CONNECTION_CONGESTED: Self = Self(0x8f);
    /// Generic failure.
    pub const FAILURE: Self = Self(0x101);

    /// Whether this status denotes success.
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match *self {
            Self::SUCCESS => "success",
            Self::READ_NOT_PERMITTED => "read not permitted",
            Self::WRITE_NOT_PERMITTED => "write not permitted",
            Self::INSUFFICIENT_AUTHENTICATION => "insufficient authentication",
            Self::REQUEST_NOT_SUPPORTED => "request not supported",
            Self::INVALID_OFFSET => "invalid offset",
            Self::INVALID_ATTRIBUTE_LENGTH => "invalid attribute length",
            Self::INSUFFICIENT_ENCRYPTION => "insufficient encryption",
            Self::CONNECTION_CONGESTED => "connection congested",
            Self::FAILURE => "failure",
            _ => return write!(f, "status 0x{:02x}", self.0),
        };
        write!(f, "{} (0x{:02x})", label, self.0)
    }
}

/// Link state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionState {
    /// No link.
    Disconnected,
    /// Link establishment in progress.
    Connecting,
    /// Link established.
    Connected,
    /// Link teardown in progress.
    Disconnecting,
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WriteType {
    /// Write request; the peer acknowledges.
    #[default]
    WithResponse,
    /// Write command; no acknowledgement.
    WithoutResponse,
}

/// GATT characteristic property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    /// Whether any of the bits in `mask` are set.
    pub const fn contains(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub const fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn can_write(self) -> bool {
        self.contains(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    /// Notify or indicate.
    pub const fn can_notify(self) -> bool {
        self.contains(Self::NOTIFY | Self::INDICATE)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 6] = [
            (CharacteristicProperties::BROADCAST, "broadcast"),
            (CharacteristicProperties::READ, "read"),
            (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (CharacteristicProperties::WRITE, "write"),
            (CharacteristicProperties::NOTIFY, "notify"),
            (CharacteristicProperties::INDICATE, "indicate"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bits.
    pub properties: CharacteristicProperties,
    /// Descriptor UUIDs.
    #[cfg_attr(feature = "serde", serde(default))]
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// Create a characteristic with no descriptors.
    pub fn new(uuid: Uuid, properties: u8) -> Self {
        Self {
            uuid,
            properties: CharacteristicProperties(properties),
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(uuid);
        self
    }

    /// Whether the Client Characteristic Configuration descriptor is present.
    pub fn has_notification_descriptor(&self) -> bool {
        self.descriptors.contains(&CLIENT_CHARACTERISTIC_CONFIG)
    }
}

/// A primary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in discovery order.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Create an empty service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic.
    #[must_use]
    pub fn with_characteristic(mut self, characteristic: GattCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Fully qualified addresses of every characteristic in this service.
    pub fn addresses(&self) -> impl Iterator<Item = CharacteristicAddress> + '_ {
        self.characteristics
            .iter()
            .map(|c| CharacteristicAddress::new(self.uuid, c.uuid))
    }
}

/// Parse a hex payload such as `"01ff"`, `"01 ff"` or `"0x01ff"`.
pub fn parse_hex(s: &str) -> ParseResult<Vec<u8>> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    hex::decode(&digits).map_err(|e| match e {
        hex::FromHexError::OddLength => {
            ParseError::InvalidHex(format!("odd number of digits in '{}'", s))
        }
        hex::FromHexError::InvalidHexCharacter { c, .. } => {
            ParseError::InvalidHex(format!("non-hex digit '{}' in '{}'", c, s))
        }
        other => ParseError::InvalidHex(format!("{} in '{}'", other, s)),
    })
}

/// Format bytes as lowercase hex without separators.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
