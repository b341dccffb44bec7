//! Output formatting for scan results and session events.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use blecentral_core::{DeviceRecord, GattService, SessionEvent, to_hex};
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Format scan results as a text table.
pub fn format_scan_text(devices: &[DeviceRecord], show_tips: bool) -> String {
    let mut output = String::new();

    if devices.is_empty() {
        output.push_str("No peripherals found.\n");
        if show_tips {
            output.push_str("\nMake sure:\n");
            output.push_str("  - Bluetooth is enabled on this computer\n");
            output.push_str("  - The peripheral is advertising and within range\n");
        }
        return output;
    }

    #[derive(Tabled)]
    struct DeviceRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Address")]
        address: String,
    }

    let rows: Vec<DeviceRow> = devices
        .iter()
        .map(|d| DeviceRow {
            name: d.display_name().to_string(),
            address: d.address.clone(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::sharp());

    let _ = writeln!(output, "Found {} device(s)\n", devices.len());
    let _ = writeln!(output, "{}", table);

    if show_tips {
        output.push_str("\nConnect with: blecentral connect <ADDRESS>\n");
    }
    output
}

/// Format scan results as JSON.
pub fn format_scan_json(devices: &[DeviceRecord]) -> Result<String> {
    let mut json = serde_json::to_string_pretty(devices).context("Failed to serialize devices")?;
    json.push('\n');
    Ok(json)
}

/// Format the discovered GATT catalog.
pub fn format_services_text(services: &[GattService]) -> String {
    let mut output = String::new();
    for service in services {
        let _ = writeln!(output, "Service {}", service.uuid);
        for characteristic in &service.characteristics {
            let _ = writeln!(
                output,
                "  Characteristic {}  [{}]",
                characteristic.uuid, characteristic.properties
            );
        }
    }
    output
}

/// Format one session event as a single line of text.
///
/// Returns `None` for events that are not interesting to a terminal user.
pub fn format_event_text(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::ConnectionReady { device, mtu } => {
            format!("Connected to {} (MTU {})", device, mtu)
        }
        SessionEvent::ConnectionFailed { address, reason } => {
            format!("Connection to {} failed: {}", address, reason)
        }
        SessionEvent::Disconnected { address } => format!("Disconnected from {}", address),
        SessionEvent::CharacteristicChanged { target, value } => {
            format!("notify {} = {}{}", target, to_hex(value), printable_suffix(value))
        }
        SessionEvent::CharacteristicRead {
            target,
            value,
            status,
        } if status.is_success() => {
            format!("read   {} = {}{}", target, to_hex(value), printable_suffix(value))
        }
        SessionEvent::CharacteristicRead { target, status, .. } => {
            format!("read   {} failed: {}", target, status)
        }
        SessionEvent::CharacteristicWritten { target, status } if status.is_success() => {
            format!("write  {} ok", target)
        }
        SessionEvent::CharacteristicWritten { target, status } => {
            format!("write  {} failed: {}", target, status)
        }
        SessionEvent::BluetoothUnavailable => "Bluetooth adapter unavailable".to_string(),
        _ => return None,
    };
    Some(line)
}

/// Format one session event as a compact JSON line.
pub fn format_event_json(event: &SessionEvent) -> Result<String> {
    serde_json::to_string(event).context("Failed to serialize event")
}

/// ` ("text")` when the value is printable UTF-8, otherwise empty.
fn printable_suffix(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => {
            format!(" ({:?})", text)
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blecentral_core::uuids::{BATTERY_LEVEL, BATTERY_SERVICE};
    use blecentral_core::{CharacteristicAddress, GattStatus};

    fn battery() -> CharacteristicAddress {
        CharacteristicAddress::new(BATTERY_SERVICE, BATTERY_LEVEL)
    }

    // --- scan output ---

    #[test]
    fn test_scan_text_empty_with_tips() {
        let text = format_scan_text(&[], true);
        assert!(text.contains("No peripherals found"));
        assert!(text.contains("Make sure"));
        assert!(!format_scan_text(&[], false).contains("Make sure"));
    }

    #[test]
    fn test_scan_text_lists_devices() {
        let devices = vec![
            DeviceRecord::new("AA:AA:AA:AA:AA:AA", Some("Thermometer".to_string())),
            DeviceRecord::new("BB:BB:BB:BB:BB:BB", None),
        ];
        let text = format_scan_text(&devices, false);
        assert!(text.contains("Found 2 device(s)"));
        assert!(text.contains("Name"));
        assert!(text.contains("Address"));
        assert!(text.contains("Thermometer"));
        assert!(text.contains("AA:AA:AA:AA:AA:AA"));
        assert!(text.contains("BB:BB:BB:BB:BB:BB"));
        assert!(!text.contains("Connect with"));
    }

    #[test]
    fn test_scan_text_unnamed_device_shows_address_twice() {
        let devices = vec![DeviceRecord::new("CC:CC:CC:CC:CC:CC", None)];
        let text = format_scan_text(&devices, true);
        let row = text
            .lines()
            .find(|line| line.contains("CC:CC:CC:CC:CC:CC"))
            .unwrap();
        assert_eq!(row.matches("CC:CC:CC:CC:CC:CC").count(), 2);
        assert!(text.contains("Connect with: blecentral connect <ADDRESS>"));
    }

    #[test]
    fn test_scan_json_is_array() {
        let devices = vec![DeviceRecord::new("AA:AA", Some("Tag".to_string()))];
        let json = format_scan_json(&devices).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(1));
        assert_eq!(value[0]["address"], "AA:AA");
    }

    // --- events ---

    #[test]
    fn test_event_text_notification() {
        let event = SessionEvent::CharacteristicChanged {
            target: battery(),
            value: b"hi".to_vec(),
        };
        let line = format_event_text(&event).unwrap();
        assert_eq!(line, "notify 180f/2a19 = 6869 (\"hi\")");
    }

    #[test]
    fn test_event_text_binary_value_has_no_suffix() {
        let event = SessionEvent::CharacteristicRead {
            target: battery(),
            value: vec![0x00, 0x64],
            status: GattStatus::SUCCESS,
        };
        assert_eq!(
            format_event_text(&event).unwrap(),
            "read   180f/2a19 = 0064"
        );
    }

    #[test]
    fn test_event_text_failed_write() {
        let event = SessionEvent::CharacteristicWritten {
            target: battery(),
            status: GattStatus::WRITE_NOT_PERMITTED,
        };
        let line = format_event_text(&event).unwrap();
        assert!(line.starts_with("write  180f/2a19 failed"));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = SessionEvent::Disconnected {
            address: "AA".to_string(),
        };
        let json = format_event_json(&event).unwrap();
        assert!(json.contains("\"type\":\"disconnected\""));
    }
}
