//! Well-known Bluetooth UUIDs and helpers for 16-bit short forms.
//!
//! Services and characteristics defined by the Bluetooth SIG are usually
//! written as 16-bit values (`180f`, `2a19`). They expand against the
//! Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.

use uuid::Uuid;

use crate::error::{ParseError, ParseResult};

/// The Bluetooth base UUID that 16-bit and 32-bit aliases expand against.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

const BASE_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

/// Expand a 16-bit SIG-assigned number into a full UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit alias of `uuid` if it lies on the Bluetooth base UUID.
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_MASK != BLUETOOTH_BASE_UUID.as_u128() || value >> 112 != 0 {
        return None;
    }
    Some((value >> 96) as u16)
}

/// Parse a UUID written either in full or as a 16-bit hex alias.
///
/// ```
/// use blecentral_types::uuid::{parse_uuid, BATTERY_SERVICE};
///
/// assert_eq!(parse_uuid("180f").unwrap(), BATTERY_SERVICE);
/// assert_eq!(parse_uuid("0x180F").unwrap(), BATTERY_SERVICE);
/// assert_eq!(
///     parse_uuid("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
///     BATTERY_SERVICE
/// );
/// ```
pub fn parse_uuid(s: &str) -> ParseResult<Uuid> {
    let trimmed = s.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if short.len() == 4 {
        return u16::from_str_radix(short, 16)
            .map(from_short)
            .map_err(|_| ParseError::InvalidUuid(s.to_string()));
    }

    Uuid::parse_str(trimmed).map_err(|_| ParseError::InvalidUuid(s.to_string()))
}

// --- Descriptors ---

/// Client Characteristic Configuration descriptor; writing it enables
/// notifications or indications on the owning characteristic.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = from_short(0x2902);

/// Value written to the CCC descriptor to enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Value written to the CCC descriptor to enable indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

// --- Standard services ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = from_short(0x1800);

/// Generic Attribute Profile (GATT) service.
pub const GATT_SERVICE: Uuid = from_short(0x1801);

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = from_short(0x180a);

/// Battery service.
pub const BATTERY_SERVICE: Uuid = from_short(0x180f);

// --- Standard characteristics ---

/// Device name characteristic.
pub const DEVICE_NAME: Uuid = from_short(0x2a00);

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = from_short(0x2a19);

/// Service Changed characteristic (GATT service).
pub const SERVICE_CHANGED: Uuid = from_short(0x2a05);
