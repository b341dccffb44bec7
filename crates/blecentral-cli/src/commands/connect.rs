//! Connect command implementation.
//!
//! Connects to one peripheral, runs the requested writes and reads in order,
//! then listens for notifications before disconnecting.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use blecentral_core::{
    BleCentralController, BtleplugTransport, CharacteristicAddress, ControllerState,
    DeviceRecord, EventReceiver, SessionEvent, addresses_match, parse_hex,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cli::{OutputFormat, WriteSpec};
use crate::commands::scan::collect_scan;
use crate::config::Config;
use crate::format::{format_event_json, format_event_text, format_services_text};

/// Time allowed for a single read or write to complete.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the link to come down after a disconnect request.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Arguments of the `connect` command.
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub address: String,
    pub listen: u64,
    pub reads: Vec<CharacteristicAddress>,
    pub writes: Vec<WriteSpec>,
    pub text: bool,
    pub timeout: u64,
    pub scan: u64,
    pub format: OutputFormat,
}

/// What to do once connected.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    pub address: String,
    pub writes: Vec<(CharacteristicAddress, Vec<u8>)>,
    pub reads: Vec<CharacteristicAddress>,
    pub listen: Duration,
    pub connect_timeout: Duration,
}

impl ConnectArgs {
    /// Decode write values and build the session plan.
    pub fn plan(&self) -> Result<SessionPlan> {
        let writes = self
            .writes
            .iter()
            .map(|spec| {
                let value = if self.text {
                    spec.value.clone().into_bytes()
                } else {
                    parse_hex(&spec.value)
                        .with_context(|| format!("Invalid hex value for {}", spec.target))?
                };
                Ok((spec.target, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionPlan {
            address: self.address.clone(),
            writes,
            reads: self.reads.clone(),
            listen: Duration::from_secs(self.listen),
            connect_timeout: Duration::from_secs(self.timeout),
        })
    }
}

pub async fn cmd_connect(args: ConnectArgs, quiet: bool, config: &Config) -> Result<()> {
    let plan = args.plan()?;
    let controller = BtleplugTransport::controller(config.controller_config(None)?)
        .await
        .context("Failed to start BLE controller")?;

    let text = matches!(args.format, OutputFormat::Text);
    let print_event = |event: &SessionEvent| match args.format {
        OutputFormat::Text => {
            if let Some(line) = format_event_text(event) {
                println!("{}", line);
            }
        }
        OutputFormat::Json => match format_event_json(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("{:#}", e),
        },
    };

    // btleplug can only connect to peripherals the adapter has seen advertising.
    if args.scan > 0 {
        if !quiet && text {
            eprintln!("Scanning for {}s...", args.scan);
        }
        match collect_scan(&controller, Duration::from_secs(args.scan)).await {
            Ok(devices) => {
                if !devices.iter().any(|d| addresses_match(&d.address, &args.address)) {
                    warn!(address = %args.address, "Peripheral not seen during scan");
                }
            }
            Err(e) => {
                controller.shutdown().await.ok();
                return Err(e);
            }
        }
    }

    if !quiet && text {
        eprintln!("Connecting to {}...", args.address);
    }
    let result = run_session(&controller, &plan, |event| print_event(event)).await;

    if let Ok(device) = &result
        && !quiet
        && text
    {
        eprintln!("Session with {} finished", device.display_name());
    }
    controller.shutdown().await.ok();
    result.map(|_| ())
}

/// Connect, run `plan` and disconnect.
///
/// Every event received while the session runs is handed to `on_event`.
/// Returns the connected device.
pub async fn run_session(
    controller: &BleCentralController,
    plan: &SessionPlan,
    mut on_event: impl FnMut(&SessionEvent),
) -> Result<DeviceRecord> {
    let mut events = controller.subscribe();
    controller
        .connect(plan.address.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", plan.address))?;

    let ready = wait_event(&mut events, plan.connect_timeout, &mut on_event, |e| {
        matches!(
            e,
            SessionEvent::ConnectionReady { .. }
                | SessionEvent::ConnectionFailed { .. }
                | SessionEvent::Disconnected { .. }
        )
    })
    .await
    .with_context(|| format!("Timed out connecting to {}", plan.address));

    let device = match ready {
        Ok(SessionEvent::ConnectionReady { device, mtu }) => {
            info!(device = %device, mtu, "Connected");
            device
        }
        Ok(SessionEvent::ConnectionFailed { reason, .. }) => {
            bail!("Connection to {} failed: {}", plan.address, reason)
        }
        Ok(_) => bail!("{} disconnected during connection setup", plan.address),
        Err(e) => {
            controller.close().await.ok();
            return Err(e);
        }
    };

    let outcome = run_operations(controller, plan, &mut events, &mut on_event).await;

    controller.disconnect().await.ok();
    if controller
        .wait_for(
            |s| !s.is_connecting_or_ready() && s != ControllerState::Disconnecting,
            DISCONNECT_TIMEOUT,
        )
        .await
        .is_err()
    {
        warn!("Peripheral did not confirm the disconnect, closing");
        controller.close().await.ok();
    }

    outcome.map(|()| device)
}

async fn run_operations(
    controller: &BleCentralController,
    plan: &SessionPlan,
    events: &mut EventReceiver,
    on_event: &mut impl FnMut(&SessionEvent),
) -> Result<()> {
    let services = controller.services().await?;
    debug!("Discovered services:\n{}", format_services_text(&services));

    for (target, value) in &plan.writes {
        let target = *target;
        controller
            .write(target, value.clone())
            .await
            .with_context(|| format!("Failed to write {}", target))?;
        let done = wait_event(events, OPERATION_TIMEOUT, on_event, |e| {
            matches!(e, SessionEvent::CharacteristicWritten { target: t, .. } if *t == target)
                || matches!(e, SessionEvent::Disconnected { .. })
        })
        .await
        .with_context(|| format!("Write to {} did not complete", target))?;
        check_link(&done)?;
    }

    for target in &plan.reads {
        let target = *target;
        controller
            .read(target)
            .await
            .with_context(|| format!("Failed to read {}", target))?;
        let done = wait_event(events, OPERATION_TIMEOUT, on_event, |e| {
            matches!(e, SessionEvent::CharacteristicRead { target: t, .. } if *t == target)
                || matches!(e, SessionEvent::Disconnected { .. })
        })
        .await
        .with_context(|| format!("Read of {} did not complete", target))?;
        check_link(&done)?;
    }

    if !plan.listen.is_zero() {
        // Elapsing the listen window is the normal way out.
        if let Ok(event) = wait_event(events, plan.listen, on_event, |e| {
            matches!(e, SessionEvent::Disconnected { .. })
        })
        .await
        {
            check_link(&event)?;
        }
    }
    Ok(())
}

fn check_link(event: &SessionEvent) -> Result<()> {
    if let SessionEvent::Disconnected { address } = event {
        bail!("{} disconnected", address);
    }
    Ok(())
}

/// Forward events to `on_event` until one matches `stop` or `window` elapses.
///
/// Windows too long to express as an instant never elapse.
async fn wait_event(
    events: &mut EventReceiver,
    window: Duration,
    on_event: &mut impl FnMut(&SessionEvent),
    stop: impl Fn(&SessionEvent) -> bool,
) -> Result<SessionEvent> {
    let elapsed = sleep(window);
    tokio::pin!(elapsed);

    loop {
        tokio::select! {
            () = &mut elapsed => bail!("deadline elapsed"),
            received = events.recv() => match received {
                Ok(event) => {
                    on_event(&event);
                    if stop(&event) {
                        return Ok(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged");
                }
                Err(RecvError::Closed) => bail!("controller stopped"),
            },
        }
    }
}
