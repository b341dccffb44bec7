//! Example: Connecting and Listening for Notifications
//!
//! This example connects to a peripheral, waits for the GATT handshake to
//! finish, prints the discovered services and then prints every
//! notification until Ctrl-C.
//!
//! Run with: `cargo run --example connect_and_listen -- AA:BB:CC:DD:EE:FF`

use std::time::Duration;

use blecentral_core::{BtleplugTransport, ControllerConfig, SessionEvent, to_hex};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let address = std::env::args()
        .nth(1)
        .ok_or("usage: connect_and_listen <address>")?;

    let controller = BtleplugTransport::controller(ControllerConfig::default()).await?;
    let mut events = controller.subscribe();

    // The adapter only knows peripherals it has seen advertising.
    println!("Scanning...");
    controller.start_scan(Duration::from_secs(5)).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Ok(event) = event else { break };
                match event {
                    SessionEvent::ScanCompleted { .. } => {
                        println!("Connecting to {}...", address);
                        controller.connect(address.as_str()).await?;
                    }
                    SessionEvent::ConnectionReady { device, mtu } => {
                        println!("Connected to {} (MTU {})", device, mtu);
                        for service in controller.services().await? {
                            println!("  Service {}", service.uuid);
                            for c in &service.characteristics {
                                println!("    Characteristic {} (properties 0x{:02x})", c.uuid, c.properties.0);
                            }
                        }
                        println!();
                        println!("Listening for notifications. Press Ctrl-C to stop.");
                    }
                    SessionEvent::CharacteristicChanged { target, value } => {
                        println!("{} -> {}", target, to_hex(&value));
                    }
                    SessionEvent::ConnectionFailed { reason, .. } => {
                        println!("Connection failed: {}", reason);
                        break;
                    }
                    SessionEvent::Disconnected { .. } => {
                        println!("Disconnected");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    controller.disconnect().await?;
    controller.shutdown().await?;
    Ok(())
}
