//! Public controller facade.
//!
//! [`BleCentralController`] owns a background task that runs the
//! [`ConnectionStateMachine`]. Every method sends a request to that task,
//! so all state transitions happen on one task regardless of which thread
//! the caller or the transport callbacks run on.
//!
//! Methods return as soon as the request has been validated and queued.
//! Outcomes arrive as [`SessionEvent`]s.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use blecentral_types::{CharacteristicAddress, DeviceRecord, GattService, WriteType};

use crate::callback::{GattCallback, GattEvent, GattEventListener};
use crate::config::ControllerConfig;
use crate::dispatcher::Command;
use crate::error::{Error, Result};
use crate::events::{EventReceiver, EventSender, EventSink, SessionEvent, event_channel};
use crate::machine::{ConnectionStateMachine, ControllerState};
use crate::transport::Transport;

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: ControllerState,
    /// Connected peripheral, once ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    pub services: Vec<GattService>,
    /// Devices found by the last completed scan.
    pub known_devices: Vec<DeviceRecord>,
}

enum Request {
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
    SetEventSink {
        sender: Option<EventSender>,
        reply: oneshot::Sender<Option<EventSender>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A BLE central controller.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use blecentral_core::{BleCentralController, ControllerConfig, MockTransport, SessionEvent};
///
/// #[tokio::main]
/// async fn main() -> blecentral_core::Result<()> {
///     let controller = BleCentralController::spawn(MockTransport::new(), ControllerConfig::default())?;
///     let mut events = controller.subscribe();
///
///     controller.start_scan(Duration::from_millis(50)).await?;
///     loop {
///         if let SessionEvent::ScanCompleted { devices } = events.recv().await.unwrap() {
///             assert!(devices.is_empty());
///             break;
///         }
///     }
///     controller.shutdown().await
/// }
/// ```
pub struct BleCentralController {
    requests: mpsc::UnboundedSender<Request>,
    events: EventSender,
    initial_events: Mutex<Option<EventReceiver>>,
    state: watch::Receiver<ControllerState>,
    callback: Arc<GattCallback>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BleCentralController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleCentralController")
            .field("state", &self.state())
            .field("running", &!self.requests.is_closed())
            .finish()
    }
}

impl BleCentralController {
    /// Start the controller task on the current tokio runtime.
    ///
    /// If the transport reports no adapter, a
    /// [`SessionEvent::BluetoothUnavailable`] is queued for the first
    /// [`subscribe`](Self::subscribe) receiver and scans and connects are
    /// refused with [`Error::TransportUnavailable`].
    #[tracing::instrument(level = "info", skip_all, fields(settle = ?config.settle_interval, target_mtu = config.target_mtu))]
    pub fn spawn<T: Transport>(transport: T, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::unsupported("the controller needs a tokio runtime"))?;

        let (events, initial) = event_channel(config.event_capacity);
        let machine = ConnectionStateMachine::new(
            transport,
            config,
            EventSink::new(Some(events.clone())),
        );
        let state = machine.watch_state();
        let callback = machine.callback();

        let (gatt_tx, gatt_rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn GattEventListener> = Arc::new(move |event: GattEvent| {
            // Ignore error if the controller task is gone
            let _ = gatt_tx.send(event);
        });
        callback.set_listener(Some(listener));

        if machine.transport_available() {
            info!("Controller started");
        } else {
            warn!("Bluetooth unavailable, controller started without an adapter");
            let _ = events.send(SessionEvent::BluetoothUnavailable);
        }

        let (requests, request_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run(machine, request_rx, gatt_rx));

        Ok(Self {
            requests,
            events,
            initial_events: Mutex::new(Some(initial)),
            state,
            callback,
            task: Mutex::new(Some(task)),
        })
    }

    async fn submit(&self, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::Submit { command, reply })?;
        rx.await?
    }

    /// Open a scan window of `duration`.
    ///
    /// A [`SessionEvent::ScanCompleted`] follows when the window closes.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn start_scan(&self, duration: Duration) -> Result<()> {
        self.submit(Command::StartScan { duration }).await
    }

    /// Close the scan window early. Harmless when no scan is running.
    pub async fn stop_scan(&self) -> Result<()> {
        self.submit(Command::StopScan).await
    }

    /// Connect to `address`, or re-activate the existing link to it.
    ///
    /// The handshake runs in the background and ends with
    /// [`SessionEvent::ConnectionReady`] or [`SessionEvent::ConnectionFailed`].
    #[tracing::instrument(level = "info", skip_all, fields(address = tracing::field::Empty))]
    pub async fn connect(&self, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        tracing::Span::current().record("address", address.as_str());
        self.submit(Command::Connect { address }).await
    }

    /// Begin an orderly disconnect of the active session.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        self.submit(Command::Disconnect).await
    }

    /// Release the active session without waiting for the peer.
    pub async fn close(&self) -> Result<()> {
        self.submit(Command::Close).await
    }

    /// Write `value` to `target` with a write request.
    ///
    /// Empty payloads and writes with no active link are accepted and
    /// ignored.
    pub async fn write(&self, target: CharacteristicAddress, value: impl Into<Vec<u8>>) -> Result<()> {
        self.write_with(target, value, WriteType::WithResponse).await
    }

    /// Write `value` to `target` with an explicit write type.
    #[tracing::instrument(level = "debug", skip_all, fields(%target))]
    pub async fn write_with(
        &self,
        target: CharacteristicAddress,
        value: impl Into<Vec<u8>>,
        write_type: WriteType,
    ) -> Result<()> {
        self.submit(Command::Write {
            target,
            value: value.into(),
            write_type,
        })
        .await
    }

    /// Write the UTF-8 bytes of `text` to `target`.
    pub async fn write_text(&self, target: CharacteristicAddress, text: &str) -> Result<()> {
        self.write(target, text.as_bytes()).await
    }

    /// Read `target`. The value arrives as [`SessionEvent::CharacteristicRead`].
    #[tracing::instrument(level = "debug", skip_all, fields(%target))]
    pub async fn read(&self, target: CharacteristicAddress) -> Result<()> {
        self.submit(Command::Read { target }).await
    }

    /// Replace the event sink, returning the previous sender.
    ///
    /// Receivers from [`subscribe`](Self::subscribe) only see events while
    /// the controller's own sender is installed.
    pub async fn set_event_sink(&self, sender: Option<EventSender>) -> Result<Option<EventSender>> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::SetEventSink { sender, reply })?;
        Ok(rx.await?)
    }

    /// Subscribe to session events.
    ///
    /// The first call returns a receiver created with the controller, so it
    /// also sees events emitted during start-up.
    pub fn subscribe(&self) -> EventReceiver {
        self.initial_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// The controller's own event sender.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver that tracks the controller state.
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(ControllerState) -> bool,
        timeout: Duration,
    ) -> Result<ControllerState> {
        let mut state = self.state.clone();
        let wait = async {
            let reached = state
                .wait_for(|s| predicate(*s))
                .await
                .map_err(|_| Error::ChannelClosed)?;
            Ok::<_, Error>(*reached)
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout("wait for controller state", timeout))?
    }

    /// Snapshot of the session as seen by the controller task.
    pub async fn session(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::Snapshot { reply })?;
        Ok(rx.await?)
    }

    /// The connected peripheral, once the session is ready.
    pub async fn device(&self) -> Result<Option<DeviceRecord>> {
        Ok(self.session().await?.device)
    }

    /// Negotiated MTU of the active session.
    pub async fn mtu(&self) -> Result<Option<u16>> {
        Ok(self.session().await?.mtu)
    }

    /// Services discovered for the active session.
    pub async fn services(&self) -> Result<Vec<GattService>> {
        Ok(self.session().await?.services)
    }

    /// Stop scanning, release the session and end the controller task.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown { reply }).is_ok() {
            // The task may already be gone.
            let _ = rx.await;
        }
        self.callback.set_listener(None);

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Controller task ended abnormally");
        }
        Ok(())
    }
}

impl Drop for BleCentralController {
    fn drop(&mut self) {
        // Dropping the request sender ends the task, which releases the session.
        self.callback.set_listener(None);
    }
}

async fn run<T: Transport>(
    mut machine: ConnectionStateMachine<T>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut gatt: mpsc::UnboundedReceiver<GattEvent>,
) {
    loop {
        let wakeup = machine.next_wakeup(Instant::now());
        let timer = async move {
            match wakeup {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            Some(event) = gatt.recv() => machine.handle_gatt_event(event),
            request = requests.recv() => match request {
                Some(Request::Submit { command, reply }) => {
                    let _ = reply.send(machine.submit(command));
                }
                Some(Request::SetEventSink { sender, reply }) => {
                    let _ = reply.send(machine.set_event_sink(sender));
                }
                Some(Request::Snapshot { reply }) => {
                    let _ = reply.send(SessionSnapshot {
                        state: machine.state(),
                        device: machine.device().cloned(),
                        mtu: machine.mtu(),
                        services: machine.services().to_vec(),
                        known_devices: machine.known_devices().iter().cloned().collect(),
                    });
                }
                Some(Request::Shutdown { reply }) => {
                    machine.shutdown();
                    let _ = reply.send(());
                    break;
                }
                None => {
                    debug!("Controller handle dropped");
                    machine.shutdown();
                    break;
                }
            },
            _ = timer => {}
        }

        machine.poll(Instant::now());
    }
    info!("Controller stopped");
}
