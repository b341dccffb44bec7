//! Example: Scanning for BLE Peripherals
//!
//! This example opens a ten-second scan window and prints every peripheral
//! that advertised during it, deduplicated by address.
//!
//! Run with: `cargo run --example scan_devices`

use std::time::Duration;

use blecentral_core::{BtleplugTransport, ControllerConfig, SessionEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let controller = BtleplugTransport::controller(ControllerConfig::default()).await?;
    let mut events = controller.subscribe();

    println!("Scanning for BLE peripherals...");
    println!();
    controller.start_scan(Duration::from_secs(10)).await?;

    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::BluetoothUnavailable => {
                println!("No Bluetooth adapter available.");
                return Ok(());
            }
            SessionEvent::ScanCompleted { devices } if devices.is_empty() => {
                println!("No peripherals found.");
                println!();
                println!("Make sure:");
                println!("  - Bluetooth is enabled on this computer");
                println!("  - A peripheral is advertising within range");
                break;
            }
            SessionEvent::ScanCompleted { devices } => {
                println!("Found {} device(s):", devices.len());
                println!();
                for device in &devices {
                    println!("  {}", device.display_name());
                    println!("    Identifier: {}", device.address);
                }
                break;
            }
            _ => {}
        }
    }

    controller.shutdown().await?;
    Ok(())
}
