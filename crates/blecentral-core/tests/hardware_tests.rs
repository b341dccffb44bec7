//! Hardware integration tests for blecentral-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```text
//! cargo test --package blecentral-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the peripheral via environment variables:
//! - `BLECENTRAL_DEVICE`: address (or macOS UUID) of a connectable peripheral
//! - `BLECENTRAL_WRITE_TARGET`: optional `service/characteristic` to write to
//!
//! Example:
//! ```text
//! BLECENTRAL_DEVICE="AA:BB:CC:DD:EE:FF" cargo test --package blecentral-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::time::Duration;

use blecentral_core::{
    BtleplugTransport, CharacteristicAddress, ControllerConfig, ControllerState, EventReceiver,
    SessionEvent,
};
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Scan window used by the scan tests
const SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Get device identifier from environment
fn get_device() -> Option<String> {
    env::var("BLECENTRAL_DEVICE").ok().filter(|s| !s.is_empty())
}

async fn wait_for_event(
    events: &mut EventReceiver,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    timeout(BLE_TIMEOUT, async {
        while let Ok(event) = events.recv().await {
            println!("  event: {}", serde_json::to_string(&event).unwrap_or_default());
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

// =============================================================================
// Scan Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_reports_devices() {
    let controller = BtleplugTransport::controller(ControllerConfig::default())
        .await
        .expect("controller should start");
    let mut events = controller.subscribe();

    controller.start_scan(SCAN_WINDOW).await.expect("scan should start");
    let event = wait_for_event(&mut events, |e| matches!(e, SessionEvent::ScanCompleted { .. }))
        .await
        .expect("scan should complete");

    if let SessionEvent::ScanCompleted { devices } = event {
        println!("Found {} devices", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }
    assert_eq!(controller.state(), ControllerState::Idle);
    controller.shutdown().await.unwrap();
}

// =============================================================================
// Connection Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_disconnect_cycle() {
    let address = match get_device() {
        Some(d) => d,
        None => {
            println!("SKIP: No device configured (set BLECENTRAL_DEVICE env var)");
            return;
        }
    };

    let controller = BtleplugTransport::controller(ControllerConfig::default())
        .await
        .expect("controller should start");
    let mut events = controller.subscribe();

    // The adapter only knows peripherals it has seen advertising.
    controller.start_scan(SCAN_WINDOW).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::ScanCompleted { .. })).await;

    println!("Connecting to {}", address);
    controller.connect(address.as_str()).await.unwrap();
    let outcome = wait_for_event(&mut events, |e| {
        matches!(
            e,
            SessionEvent::ConnectionReady { .. } | SessionEvent::ConnectionFailed { .. }
        )
    })
    .await;
    assert!(
        matches!(outcome, Some(SessionEvent::ConnectionReady { .. })),
        "connection did not become ready: {:?}",
        outcome
    );

    let services = controller.services().await.unwrap();
    println!("Discovered {} services", services.len());

    if let Some(target) = env::var("BLECENTRAL_WRITE_TARGET")
        .ok()
        .and_then(|s| s.parse::<CharacteristicAddress>().ok())
    {
        controller.write(target, vec![0x01]).await.unwrap();
        let written =
            wait_for_event(&mut events, |e| matches!(e, SessionEvent::CharacteristicWritten { .. }))
                .await;
        assert!(written.is_some(), "write should complete");
    }

    controller.disconnect().await.unwrap();
    let gone = wait_for_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert!(gone.is_some(), "disconnect should complete");
    controller.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_reconnect_after_disconnect() {
    let address = match get_device() {
        Some(d) => d,
        None => {
            println!("SKIP: No device configured");
            return;
        }
    };

    let controller = BtleplugTransport::controller(ControllerConfig::default())
        .await
        .expect("controller should start");
    let mut events = controller.subscribe();
    controller.start_scan(SCAN_WINDOW).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::ScanCompleted { .. })).await;

    for attempt in 1..=2 {
        controller.connect(address.as_str()).await.unwrap();
        let ready =
            wait_for_event(&mut events, |e| matches!(e, SessionEvent::ConnectionReady { .. })).await;
        assert!(ready.is_some(), "attempt {} should reach ready", attempt);

        controller.disconnect().await.unwrap();
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
        println!("Connection cycle {} complete", attempt);

        // Brief pause
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    controller.shutdown().await.unwrap();
}
