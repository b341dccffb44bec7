//! Peripheral identifier helpers.
//!
//! On Linux and Windows a peripheral is identified by its MAC address. On
//! macOS CoreBluetooth hides the address (it reads as all zeros) and a
//! per-host UUID is used instead.

use btleplug::platform::PeripheralId;

/// Address CoreBluetooth reports for every peripheral.
pub const UNKNOWN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a plain string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_peripheral_id(&format!("{:?}", id))
}

fn strip_peripheral_id(debug: &str) -> String {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identifier to report for a peripheral: its address, or its platform ID
/// when the address is hidden.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == UNKNOWN_ADDRESS {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Compare two identifiers ignoring case and `:`/`-` separators.
pub fn addresses_match(a: &str, b: &str) -> bool {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| !matches!(c, ':' | '-'))
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };
    !a.is_empty() && normalize(a) == normalize(b)
}
