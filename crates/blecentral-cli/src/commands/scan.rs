//! Scan command implementation.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use blecentral_core::{BleCentralController, BtleplugTransport, DedupPolicy, DeviceRecord, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::cli::{DEFAULT_SCAN_SECS, OutputFormat};
use crate::config::{Config, resolve_scan_duration};
use crate::format::{format_scan_json, format_scan_text};

/// Extra time allowed past the scan window for the result to arrive.
const SCAN_GRACE: Duration = Duration::from_secs(5);

pub async fn cmd_scan(
    timeout: Option<u64>,
    format: OutputFormat,
    dedup: Option<DedupPolicy>,
    quiet: bool,
    config: &Config,
) -> Result<()> {
    let secs = resolve_scan_duration(timeout, config, DEFAULT_SCAN_SECS);
    let controller = BtleplugTransport::controller(config.controller_config(dedup)?)
        .await
        .context("Failed to start BLE controller")?;

    if !quiet && matches!(format, OutputFormat::Text) {
        eprintln!("Scanning for {}s...", secs);
    }

    let devices = collect_scan(&controller, Duration::from_secs(secs)).await;
    controller.shutdown().await.ok();
    let devices = devices?;

    let content = match format {
        OutputFormat::Json => format_scan_json(&devices)?,
        OutputFormat::Text => format_scan_text(&devices, !quiet),
    };
    print!("{}", content);
    Ok(())
}

/// Run one scan window on `controller` and return the devices it reported.
pub async fn collect_scan(
    controller: &BleCentralController,
    duration: Duration,
) -> Result<Vec<DeviceRecord>> {
    let mut events = controller.subscribe();
    controller
        .start_scan(duration)
        .await
        .context("Failed to scan for devices")?;

    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ScanCompleted { devices }) => {
                    debug!(count = devices.len(), "Scan completed");
                    return Ok(devices);
                }
                Ok(SessionEvent::BluetoothUnavailable) => {
                    bail!("No Bluetooth adapter available")
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged during scan");
                }
                Err(RecvError::Closed) => bail!("Controller stopped before the scan completed"),
            }
        }
    };

    tokio::time::timeout(duration.saturating_add(SCAN_GRACE), wait)
        .await
        .context("Scan did not complete in time")?
}
