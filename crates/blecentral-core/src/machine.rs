//! Connection and session state machine.
//!
//! The machine owns the transport, the active [`Session`] and the
//! [`CommandQueue`]. It is driven from a single task: caller commands go in
//! through [`ConnectionStateMachine::submit`], transport outcomes through
//! [`ConnectionStateMachine::handle_gatt_event`], and timers through
//! [`ConnectionStateMachine::poll`]. All transitions are therefore
//! serialized.
//!
//! ```text
//! Idle -> Scanning -> Idle
//! Idle -> Connecting -> ServicesDiscovering -> NegotiatingMtu -> Ready
//! Ready -> Disconnecting -> Idle
//! any in-progress state -> Failed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use blecentral_types::{
    CharacteristicAddress, ConnectionState, DeviceRecord, GattService, GattStatus, ScanResult,
};

use crate::callback::{GattCallback, GattEvent};
use crate::config::ControllerConfig;
use crate::dispatcher::{Command, CommandQueue};
use crate::error::{Error, Result};
use crate::events::{EventSender, EventSink, SessionEvent};
use crate::scan::{DeviceList, ScanResultAggregator};
use crate::session::{GattOp, GattOpKind, Session, SessionId};
use crate::transport::{GattLink, Transport};

/// Scan windows too long to express as an instant end this far out instead.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn scan_deadline(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Nothing in progress.
    Idle,
    /// A scan window is open and no session is active.
    Scanning,
    /// Link being established.
    Connecting,
    /// Service discovery issued.
    ServicesDiscovering,
    /// Notifications being enabled and MTU being exchanged.
    NegotiatingMtu,
    /// Session accepts reads and writes.
    Ready,
    /// Orderly disconnect in progress.
    Disconnecting,
    /// The last connection attempt failed. Connect again to retry.
    Failed,
}

impl ControllerState {
    /// Whether a connection handshake is under way.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServicesDiscovering | Self::NegotiatingMtu
        )
    }

    /// Whether a link is being established or is ready.
    pub fn is_connecting_or_ready(self) -> bool {
        self.is_handshake() || self == Self::Ready
    }

    /// Whether no session work is in progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::ServicesDiscovering => "discovering services",
            Self::NegotiatingMtu => "negotiating MTU",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// The session state machine.
pub struct ConnectionStateMachine<T: Transport> {
    transport: T,
    config: ControllerConfig,
    callback: Arc<GattCallback>,
    aggregator: Arc<ScanResultAggregator>,
    queue: CommandQueue,
    events: EventSink,
    state_tx: watch::Sender<ControllerState>,
    reported: ControllerState,
    lifecycle: ControllerState,
    scanning: bool,
    scan_requested: bool,
    scan_deadline: Option<Instant>,
    session: Option<Session<T::Link>>,
    next_session: u64,
    known_devices: DeviceList,
}

impl<T: Transport> fmt::Debug for ConnectionStateMachine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state())
            .field("session", &self.session)
            .field("pending_commands", &self.queue.len())
            .field("scan_deadline", &self.scan_deadline)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ConnectionStateMachine<T> {
    /// Create an idle machine that reports to `events`.
    pub fn new(transport: T, config: ControllerConfig, events: EventSink) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Self {
            aggregator: Arc::new(ScanResultAggregator::new(config.dedup)),
            queue: CommandQueue::new(config.settle_interval),
            callback: Arc::new(GattCallback::new()),
            transport,
            config,
            events,
            state_tx,
            reported: ControllerState::Idle,
            lifecycle: ControllerState::Idle,
            scanning: false,
            scan_requested: false,
            scan_deadline: None,
            session: None,
            next_session: 0,
            known_devices: DeviceList::new(),
        }
    }

    /// Callback handed to every link this machine opens.
    pub fn callback(&self) -> Arc<GattCallback> {
        Arc::clone(&self.callback)
    }

    /// Aggregator receiving advertisements while a scan window is open.
    pub fn aggregator(&self) -> Arc<ScanResultAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Whether the transport reports a usable adapter.
    pub fn transport_available(&self) -> bool {
        self.transport.is_available()
    }

    /// Current observable state.
    pub fn state(&self) -> ControllerState {
        if self.scanning && self.lifecycle.is_terminal() {
            ControllerState::Scanning
        } else {
            self.lifecycle
        }
    }

    /// Receiver that tracks [`state`](Self::state).
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Whether a scan window is open.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// The connected peripheral, once the session is ready.
    pub fn device(&self) -> Option<&DeviceRecord> {
        match self.lifecycle {
            ControllerState::Ready => self.session.as_ref().map(Session::device),
            _ => None,
        }
    }

    /// Negotiated MTU of the active session.
    pub fn mtu(&self) -> Option<u16> {
        self.session.as_ref().and_then(Session::mtu)
    }

    /// Services discovered for the active session.
    pub fn services(&self) -> &[GattService] {
        self.session.as_ref().map(Session::services).unwrap_or(&[])
    }

    /// Devices reported by the last completed scan.
    pub fn known_devices(&self) -> &DeviceList {
        &self.known_devices
    }

    /// Number of commands waiting for their settle interval.
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    /// Swap the event sink, returning the previous sender.
    pub fn set_event_sink(&mut self, sender: Option<EventSender>) -> Option<EventSender> {
        self.events.replace(sender)
    }

    /// Validate `command` and schedule it.
    ///
    /// Argument and precondition errors are returned here. Empty writes and
    /// reads or writes with no active link are accepted as no-ops.
    pub fn submit(&mut self, command: Command) -> Result<()> {
        match &command {
            Command::StartScan { duration } => {
                if duration.is_zero() {
                    return Err(Error::invalid_argument("scan duration must be non-zero"));
                }
                if self.scanning || self.scan_requested {
                    return Err(Error::busy("a scan is already running"));
                }
                if !self.transport.is_available() {
                    return Err(Error::TransportUnavailable);
                }
                self.scan_requested = true;
            }
            Command::Connect { address } => {
                if address.trim().is_empty() {
                    return Err(Error::invalid_argument("address must not be empty"));
                }
                if !self.transport.is_available() {
                    return Err(Error::TransportUnavailable);
                }
            }
            Command::Write { target, value, .. } => {
                if value.is_empty() {
                    debug!(%target, "Empty payload, ignoring write");
                    return Ok(());
                }
                if !self.check_target(target)? {
                    return Ok(());
                }
            }
            Command::Read { target } => {
                if !self.check_target(target)? {
                    return Ok(());
                }
            }
            _ => {}
        }

        trace!(command = command.name(), "Command queued");
        self.queue.push(command);
        Ok(())
    }

    /// Returns `Ok(false)` when there is no link to operate on.
    fn check_target(&self, target: &CharacteristicAddress) -> Result<bool> {
        let Some(session) = self.session.as_ref().filter(|s| s.has_link()) else {
            debug!(%target, "No active link, ignoring request");
            return Ok(false);
        };
        if self.lifecycle != ControllerState::Ready {
            return Err(Error::NotConnected);
        }
        if session.characteristic(target).is_none() {
            return Err(Error::characteristic_not_found(*target));
        }
        Ok(true)
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        match (self.scan_deadline, self.queue.next_deadline(now)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire the scan timer if due and issue ready commands.
    pub fn poll(&mut self, now: Instant) {
        if let Some(deadline) = self.scan_deadline
            && now >= deadline
        {
            self.finish_scan();
        }
        while let Some(command) = self.queue.pop_ready(now) {
            self.execute(command, now);
        }
    }

    fn execute(&mut self, command: Command, now: Instant) {
        debug!(command = command.name(), "Issuing command");
        match command {
            Command::StartScan { duration } => self.begin_scan(duration, now),
            Command::StopScan => self.stop_scan(),
            Command::Connect { address } => self.connect(address),
            Command::Disconnect => self.disconnect(),
            Command::Close => self.close(),
            Command::DiscoverServices { session } => self.discover_services(session),
            Command::EnableNotifications { session, target } => {
                self.enable_notifications(session, target)
            }
            Command::RequestMtu { session, mtu } => self.request_mtu(session, mtu),
            Command::Read { target } => self.issue_or_queue(GattOp::Read { target }),
            Command::Write {
                target,
                value,
                write_type,
            } => self.issue_or_queue(GattOp::Write {
                target,
                value,
                write_type,
            }),
        }
    }

    // --- Scanning ---

    fn begin_scan(&mut self, duration: Duration, now: Instant) {
        self.scan_requested = false;
        if self.lifecycle == ControllerState::Failed {
            self.lifecycle = ControllerState::Idle;
        }

        self.aggregator.start();
        let settings = self.config.scan_settings.clone();
        match self
            .transport
            .start_scan(&settings, Arc::clone(&self.aggregator))
        {
            Ok(()) => {
                info!(duration_ms = duration.as_millis() as u64, "Scan started");
                self.scanning = true;
                self.scan_deadline = Some(scan_deadline(now, duration));
                self.publish_state();
            }
            Err(e) => {
                warn!(error = %e, "Scan could not be started");
                self.aggregator.stop();
                self.publish_state();
                self.emit(SessionEvent::ScanCompleted {
                    devices: Vec::new(),
                });
            }
        }
    }

    fn stop_scan(&mut self) {
        if self.scanning {
            self.finish_scan();
        } else if let Err(e) = self.transport.stop_scan() {
            debug!(error = %e, "Stop requested with no scan running");
        }
    }

    fn finish_scan(&mut self) {
        self.scan_deadline = None;
        if let Err(e) = self.transport.stop_scan() {
            warn!(error = %e, "Failed to stop scan");
        }
        let snapshot = self.aggregator.stop();
        self.scanning = false;

        let devices = snapshot.devices();
        info!(
            devices = devices.len(),
            regular = snapshot.regular.len(),
            batch = snapshot.batch.len(),
            "Scan complete"
        );
        self.known_devices
            .replace(snapshot.regular.iter().map(ScanResult::device));
        let appended = self.known_devices.extend(&snapshot.batch);
        trace!(appended, "Batch devices appended");
        self.publish_state();
        self.emit(SessionEvent::ScanCompleted {
            devices: devices.into_iter().collect(),
        });
    }

    // --- Session lifecycle ---

    fn connect(&mut self, address: String) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.address() == address && s.has_link())
        {
            self.reactivate();
            return;
        }

        if self.release_session("replaced by a new connection") {
            self.lifecycle = ControllerState::Idle;
        }

        let device = self
            .known_devices
            .get(&address)
            .cloned()
            .unwrap_or_else(|| DeviceRecord::new(address.clone(), None));

        match self.transport.open(&address, false, self.callback()) {
            Ok(link) => {
                self.next_session += 1;
                let id = SessionId(self.next_session);
                info!(%address, session = %id, "Opening link");
                self.session = Some(Session::new(id, device, link));
                self.set_lifecycle(ControllerState::Connecting);
            }
            Err(e) => {
                warn!(%address, error = %e, "Failed to open link");
                self.emit(SessionEvent::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                });
                self.set_lifecycle(ControllerState::Failed);
            }
        }
    }

    /// Re-activate the existing link for the session's own address.
    fn reactivate(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let address = session.address().to_string();
        let Some(link) = session.link_mut() else {
            return;
        };

        match link.reconnect() {
            Ok(()) => {
                debug!(%address, "Re-activated existing link");
                if !self.lifecycle.is_connecting_or_ready() {
                    self.set_lifecycle(ControllerState::Connecting);
                }
            }
            Err(e) => {
                warn!(%address, error = %e, "Failed to re-activate link");
                self.release_session("re-activation failed");
                self.emit(SessionEvent::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                });
                self.set_lifecycle(ControllerState::Idle);
            }
        }
    }

    fn disconnect(&mut self) {
        let Some(link) = self.session.as_mut().and_then(|s| s.link_mut()) else {
            debug!("No active link, dropping disconnect");
            return;
        };
        let address = link.address().to_string();

        match link.disconnect() {
            Ok(()) => {
                info!(%address, "Disconnecting");
                self.set_lifecycle(ControllerState::Disconnecting);
            }
            Err(e) => {
                warn!(%address, error = %e, "Disconnect could not be issued, releasing link");
                self.finish_disconnect(address);
            }
        }
    }

    fn close(&mut self) {
        if self.release_session("closed") {
            info!("Session closed");
        }
        self.set_lifecycle(ControllerState::Idle);
    }

    /// Close the link and drop the session. Returns `true` if a link was
    /// actually released.
    fn release_session(&mut self, reason: &str) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        let released = session.release();
        if released {
            debug!(address = session.address(), session = %session.id(), reason, "Released link");
        }
        released
    }

    fn finish_disconnect(&mut self, address: String) {
        self.release_session("disconnected");
        self.emit(SessionEvent::Disconnected { address });
        self.set_lifecycle(ControllerState::Idle);
    }

    fn fail_session(&mut self, reason: String) {
        let address = self
            .session
            .as_ref()
            .map(|s| s.address().to_string())
            .unwrap_or_default();
        warn!(%address, %reason, "Connection failed");
        self.release_session("connection failed");
        self.emit(SessionEvent::ConnectionFailed { address, reason });
        self.set_lifecycle(ControllerState::Failed);
    }

    fn active_link(&mut self, id: SessionId) -> Option<&mut T::Link> {
        self.session
            .as_mut()
            .filter(|s| s.id() == id)
            .and_then(|s| s.link_mut())
    }

    // --- Handshake steps ---

    fn discover_services(&mut self, id: SessionId) {
        if self.lifecycle != ControllerState::Connecting {
            debug!(session = %id, state = %self.lifecycle, "Discovery no longer needed");
            return;
        }
        let Some(link) = self.active_link(id) else {
            debug!(session = %id, "Dropping discover_services for a released session");
            return;
        };
        match link.discover_services() {
            Ok(()) => self.set_lifecycle(ControllerState::ServicesDiscovering),
            Err(e) => self.fail_session(format!("service discovery could not start: {}", e)),
        }
    }

    fn enable_notifications(&mut self, id: SessionId, target: CharacteristicAddress) {
        let Some(link) = self.active_link(id) else {
            debug!(session = %id, %target, "Dropping enable_notifications for a released session");
            return;
        };
        match link.enable_notifications(&target) {
            Ok(()) => debug!(%target, "Notifications enabled"),
            Err(Error::Unsupported(reason)) => {
                debug!(%target, %reason, "Skipping characteristic without notification descriptor")
            }
            Err(e) => warn!(%target, error = %e, "Failed to enable notifications"),
        }
    }

    fn request_mtu(&mut self, id: SessionId, mtu: u16) {
        let Some(link) = self.active_link(id) else {
            debug!(session = %id, "Dropping request_mtu for a released session");
            return;
        };
        match link.request_mtu(mtu) {
            Ok(()) => debug!(mtu, "MTU requested"),
            Err(e) => self.fail_session(format!("MTU request could not be issued: {}", e)),
        }
    }

    // --- Characteristic operations ---

    fn issue_or_queue(&mut self, op: GattOp) {
        let ready = self.lifecycle == ControllerState::Ready;
        let Some(session) = self.session.as_mut().filter(|s| s.has_link()) else {
            debug!(target = %op.target(), "No active link, dropping operation");
            return;
        };
        if !ready {
            debug!(target = %op.target(), "Session not ready, dropping operation");
            return;
        }
        if session.characteristic(op.target()).is_none() {
            warn!(target = %op.target(), "Characteristic vanished from catalog, dropping operation");
            return;
        }
        if session.in_flight().is_some() {
            session.enqueue(op);
            debug!(waiting = session.waiting_len(), "Operation in flight, queued");
            return;
        }
        if !self.issue(op) {
            self.issue_next();
        }
    }

    /// Hand `op` to the link. Returns `true` if it is now in flight.
    fn issue(&mut self, op: GattOp) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(link) = session.link_mut() else {
            return false;
        };
        let result = match &op {
            GattOp::Read { target } => link.read_characteristic(target),
            GattOp::Write {
                target,
                value,
                write_type,
            } => link.write_characteristic(target, value, *write_type),
        };

        match result {
            Ok(()) => {
                trace!(target = %op.target(), "Operation issued");
                session.set_in_flight(op);
                true
            }
            Err(e) => {
                warn!(target = %op.target(), error = %e, "Operation could not be issued");
                let event = match op {
                    GattOp::Read { target } => SessionEvent::CharacteristicRead {
                        target,
                        value: Vec::new(),
                        status: GattStatus::FAILURE,
                    },
                    GattOp::Write { target, .. } => SessionEvent::CharacteristicWritten {
                        target,
                        status: GattStatus::FAILURE,
                    },
                };
                self.emit(event);
                false
            }
        }
    }

    fn issue_next(&mut self) {
        while let Some(op) = self.session.as_mut().and_then(Session::next_waiting) {
            if self.issue(op) {
                return;
            }
        }
    }

    fn complete(&mut self, kind: GattOpKind, target: &CharacteristicAddress) {
        let completed = self
            .session
            .as_mut()
            .and_then(|s| s.complete(kind, target))
            .is_some();
        if completed {
            self.issue_next();
        } else {
            debug!(%kind, %target, "Completion without a matching operation in flight");
        }
    }

    // --- GATT events ---

    /// Apply one transport outcome.
    pub fn handle_gatt_event(&mut self, event: GattEvent) {
        let current = self
            .session
            .as_ref()
            .filter(|s| s.has_link())
            .map(|s| s.address() == event.address());
        match current {
            None => {
                debug!(kind = event.kind(), address = event.address(), "No session, absorbing late GATT event");
                return;
            }
            Some(false) => {
                debug!(kind = event.kind(), address = event.address(), "Event for another peripheral, absorbing");
                return;
            }
            Some(true) => trace!(kind = event.kind(), "GATT event"),
        }

        match event {
            GattEvent::ConnectionStateChanged {
                address,
                status,
                state,
            } => self.on_connection_state(address, status, state),
            GattEvent::ServicesDiscovered { status, .. } => self.on_services_discovered(status),
            GattEvent::MtuChanged { mtu, status, .. } => self.on_mtu_changed(mtu, status),
            GattEvent::CharacteristicRead {
                target,
                value,
                status,
                ..
            } => {
                self.emit(SessionEvent::CharacteristicRead {
                    target,
                    value,
                    status,
                });
                self.complete(GattOpKind::Read, &target);
            }
            GattEvent::CharacteristicWritten { target, status, .. } => {
                self.emit(SessionEvent::CharacteristicWritten { target, status });
                self.complete(GattOpKind::Write, &target);
            }
            GattEvent::CharacteristicChanged { target, value, .. } => {
                self.emit(SessionEvent::CharacteristicChanged { target, value });
            }
        }
    }

    fn on_connection_state(&mut self, address: String, status: GattStatus, state: ConnectionState) {
        match state {
            ConnectionState::Connected if status.is_success() => {
                if self.lifecycle != ControllerState::Connecting {
                    debug!(%address, state = %self.lifecycle, "Link up, nothing to schedule");
                    return;
                }
                if let Some(session) = self.session.as_ref() {
                    info!(%address, "Connected, scheduling service discovery");
                    self.queue.push(Command::DiscoverServices {
                        session: session.id(),
                    });
                }
            }
            ConnectionState::Connected => {
                self.fail_session(format!("connection attempt reported {}", status));
            }
            ConnectionState::Disconnected => {
                if self.lifecycle.is_handshake() {
                    let reason = format!("link lost while {} ({})", self.lifecycle, status);
                    self.emit(SessionEvent::ConnectionFailed {
                        address: address.clone(),
                        reason,
                    });
                }
                info!(%address, %status, "Disconnected");
                self.finish_disconnect(address);
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                trace!(%address, ?state, "Link state transitional")
            }
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus) {
        if self.lifecycle != ControllerState::ServicesDiscovering {
            debug!(state = %self.lifecycle, "Unexpected service discovery result, ignoring");
            return;
        }
        if !status.is_success() {
            self.fail_session(format!("service discovery failed: {}", status));
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let services = session.link_mut().map(|l| l.services()).unwrap_or_default();
        session.set_services(services);
        let id = session.id();
        let targets = session.characteristic_addresses();
        info!(
            services = session.services().len(),
            characteristics = targets.len(),
            "Services discovered"
        );

        self.set_lifecycle(ControllerState::NegotiatingMtu);
        for target in targets {
            self.queue
                .push(Command::EnableNotifications { session: id, target });
        }
        self.queue.push(Command::RequestMtu {
            session: id,
            mtu: self.config.target_mtu,
        });
    }

    fn on_mtu_changed(&mut self, mtu: u16, status: GattStatus) {
        if self.lifecycle != ControllerState::NegotiatingMtu {
            debug!(mtu, state = %self.lifecycle, "Unexpected MTU change, ignoring");
            return;
        }
        let requested = self.config.target_mtu;
        if !status.is_success() || !self.config.mtu_policy.accepts(requested, mtu) {
            self.fail_session(format!(
                "MTU exchange ended at {} ({}), requested {}",
                mtu, status, requested
            ));
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.set_mtu(mtu);
        let device = session.device().clone();
        info!(address = %device.address, mtu, "Connection ready");
        self.set_lifecycle(ControllerState::Ready);
        self.emit(SessionEvent::ConnectionReady { device, mtu });
    }

    /// Stop scanning and release the session without emitting events.
    pub fn shutdown(&mut self) {
        if self.scanning {
            if let Err(e) = self.transport.stop_scan() {
                debug!(error = %e, "Failed to stop scan during shutdown");
            }
            self.aggregator.stop();
            self.scanning = false;
            self.scan_deadline = None;
        }
        self.release_session("shutdown");
        self.lifecycle = ControllerState::Idle;
        self.reported = ControllerState::Idle;
        self.state_tx.send_replace(ControllerState::Idle);
    }

    // --- Reporting ---

    fn set_lifecycle(&mut self, to: ControllerState) {
        self.lifecycle = to;
        self.publish_state();
    }

    fn publish_state(&mut self) {
        let to = self.state();
        if to == self.reported {
            return;
        }
        let from = std::mem::replace(&mut self.reported, to);
        debug!(%from, %to, "State changed");
        self.state_tx.send_replace(to);
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use blecentral_types::uuid::{
        BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIG, DEVICE_NAME, GAP_SERVICE,
    };
    use blecentral_types::{CharacteristicProperties, GattCharacteristic, WriteType};

    use super::*;
    use crate::config::MtuPolicy;
    use crate::events::{EventReceiver, event_channel};
    use crate::mock::{MockCall, MockTransport};

    const SETTLE: Duration = Duration::from_millis(10);
    const ADDR: &str = "AA:AA";

    fn battery() -> CharacteristicAddress {
        CharacteristicAddress::new(BATTERY_SERVICE, BATTERY_LEVEL)
    }

    fn device_name() -> CharacteristicAddress {
        CharacteristicAddress::new(GAP_SERVICE, DEVICE_NAME)
    }

    fn catalog() -> Vec<GattService> {
        vec![
            GattService::new(GAP_SERVICE).with_characteristic(GattCharacteristic::new(
                DEVICE_NAME,
                CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            )),
            GattService::new(BATTERY_SERVICE).with_characteristic(
                GattCharacteristic::new(
                    BATTERY_LEVEL,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                )
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG),
            ),
        ]
    }

    struct Harness {
        machine: ConnectionStateMachine<MockTransport>,
        mock: MockTransport,
        events: EventReceiver,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ControllerConfig::default())
        }

        fn with_config(config: ControllerConfig) -> Self {
            let mock = MockTransport::builder().services(catalog()).build();
            let (tx, events) = event_channel(64);
            let machine = ConnectionStateMachine::new(mock.clone(), config, EventSink::new(Some(tx)));
            Self {
                machine,
                mock,
                events,
                now: Instant::now(),
            }
        }

        fn submit(&mut self, command: Command) -> Result<()> {
            self.machine.submit(command)
        }

        /// Issue every queued command, advancing time by the settle interval.
        fn drain(&mut self) {
            self.machine.poll(self.now);
            while self.machine.pending_commands() > 0 {
                self.now += SETTLE;
                self.machine.poll(self.now);
            }
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.machine.poll(self.now);
        }

        fn event(&mut self, event: GattEvent) {
            self.machine.handle_gatt_event(event);
        }

        fn take_events(&mut self) -> Vec<SessionEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn connect(&mut self) {
            self.submit(Command::Connect {
                address: ADDR.to_string(),
            })
            .unwrap();
            self.drain();
        }

        fn connect_ready(&mut self) {
            self.connect();
            self.event(connected(ADDR));
            self.drain();
            self.event(discovered(ADDR, GattStatus::SUCCESS));
            self.drain();
            self.event(mtu_changed(ADDR, 512));
            assert_eq!(self.machine.state(), ControllerState::Ready);
            self.take_events();
        }
    }

    fn connected(address: &str) -> GattEvent {
        GattEvent::ConnectionStateChanged {
            address: address.to_string(),
            status: GattStatus::SUCCESS,
            state: ConnectionState::Connected,
        }
    }

    fn disconnected(address: &str) -> GattEvent {
        GattEvent::ConnectionStateChanged {
            address: address.to_string(),
            status: GattStatus::SUCCESS,
            state: ConnectionState::Disconnected,
        }
    }

    fn discovered(address: &str, status: GattStatus) -> GattEvent {
        GattEvent::ServicesDiscovered {
            address: address.to_string(),
            status,
        }
    }

    fn mtu_changed(address: &str, mtu: u16) -> GattEvent {
        GattEvent::MtuChanged {
            address: address.to_string(),
            mtu,
            status: GattStatus::SUCCESS,
        }
    }

    fn written(address: &str, target: CharacteristicAddress) -> GattEvent {
        GattEvent::CharacteristicWritten {
            address: address.to_string(),
            target,
            status: GattStatus::SUCCESS,
        }
    }

    fn write(target: CharacteristicAddress, value: &[u8]) -> Command {
        Command::Write {
            target,
            value: value.to_vec(),
            write_type: WriteType::WithResponse,
        }
    }

    // --- Scanning ---

    #[test]
    fn test_scan_window_collects_and_completes() {
        let mut h = Harness::new();
        h.submit(Command::StartScan {
            duration: Duration::from_millis(5000),
        })
        .unwrap();
        h.drain();
        let start = h.now;
        assert_eq!(h.machine.state(), ControllerState::Scanning);

        h.advance(Duration::from_millis(100));
        h.mock.advertise(ScanResult::new("AA:AA", Some("first")));
        h.advance(Duration::from_millis(100));
        h.mock.advertise(ScanResult::new("BB:BB", None));

        h.machine.poll(start + Duration::from_millis(4999));
        assert!(h.machine.is_scanning());

        h.machine.poll(start + Duration::from_millis(5000));
        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert_eq!(h.mock.scan_stops(), 1);

        let events = h.take_events();
        assert_eq!(
            events,
            vec![
                SessionEvent::StateChanged {
                    from: ControllerState::Idle,
                    to: ControllerState::Scanning
                },
                SessionEvent::StateChanged {
                    from: ControllerState::Scanning,
                    to: ControllerState::Idle
                },
                SessionEvent::ScanCompleted {
                    devices: vec![
                        DeviceRecord::new("AA:AA", Some("first".to_string())),
                        DeviceRecord::new("BB:BB", None),
                    ]
                },
            ]
        );
        assert_eq!(h.machine.known_devices().len(), 2);
    }

    #[test]
    fn test_scan_batch_devices_follow_regular_ones() {
        let mut h = Harness::new();
        h.submit(Command::StartScan {
            duration: Duration::from_secs(1),
        })
        .unwrap();
        h.drain();

        h.mock.advertise(ScanResult::new("CC:CC", Some("regular")));
        h.mock.batch(vec![
            ScanResult::new("AA:AA", None),
            ScanResult::new("CC:CC", Some("batched")),
            ScanResult::new("AA:AA", None),
        ]);
        h.advance(Duration::from_secs(1));

        let listed: Vec<_> = h
            .machine
            .known_devices()
            .iter()
            .map(|d| (d.address.as_str(), d.name.as_deref()))
            .collect();
        assert_eq!(listed, vec![("CC:CC", Some("regular")), ("AA:AA", None)]);
    }

    #[test]
    fn test_scan_rejected_while_running() {
        let mut h = Harness::new();
        let scan = Command::StartScan {
            duration: Duration::from_secs(1),
        };
        h.submit(scan.clone()).unwrap();
        assert!(matches!(h.submit(scan.clone()), Err(Error::Busy(_))));
        h.drain();
        assert!(matches!(h.submit(scan), Err(Error::Busy(_))));
        assert_eq!(h.mock.scan_starts(), 1);
    }

    #[test]
    fn test_scan_with_unbounded_duration_runs_until_stopped() {
        let mut h = Harness::new();
        h.submit(Command::StartScan {
            duration: Duration::MAX,
        })
        .unwrap();
        h.drain();

        assert_eq!(h.machine.state(), ControllerState::Scanning);
        let wakeup = h.machine.next_wakeup(h.now).unwrap();
        assert!(wakeup >= h.now + Duration::from_secs(86400 * 365));

        h.advance(Duration::from_secs(3600));
        assert_eq!(h.machine.state(), ControllerState::Scanning);

        h.submit(Command::StopScan).unwrap();
        h.drain();
        assert_eq!(h.machine.state(), ControllerState::Idle);
    }

    #[test]
    fn test_scan_rejects_zero_duration_and_missing_adapter() {
        let mut h = Harness::new();
        assert!(matches!(
            h.submit(Command::StartScan {
                duration: Duration::ZERO
            }),
            Err(Error::InvalidArgument(_))
        ));

        h.mock.set_available(false);
        assert!(matches!(
            h.submit(Command::StartScan {
                duration: Duration::from_secs(1)
            }),
            Err(Error::TransportUnavailable)
        ));
    }

    #[test]
    fn test_empty_scan_is_a_valid_outcome() {
        let mut h = Harness::new();
        h.submit(Command::StartScan {
            duration: Duration::from_secs(1),
        })
        .unwrap();
        h.drain();
        h.advance(Duration::from_secs(1));

        let events = h.take_events();
        assert!(events.contains(&SessionEvent::ScanCompleted { devices: vec![] }));
    }

    #[test]
    fn test_explicit_stop_completes_early_and_repeat_is_harmless() {
        let mut h = Harness::new();
        h.submit(Command::StartScan {
            duration: Duration::from_secs(10),
        })
        .unwrap();
        h.drain();
        h.mock.advertise(ScanResult::new("AA:AA", None));

        h.submit(Command::StopScan).unwrap();
        h.drain();
        assert!(!h.machine.is_scanning());
        assert!(h.machine.next_wakeup(h.now).is_none());

        h.submit(Command::StopScan).unwrap();
        h.drain();
        assert_eq!(h.mock.scan_stops(), 2);

        let completed = h
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ScanCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_failed_scan_start_reports_empty_result() {
        let mut h = Harness::new();
        h.mock.set_fail_scan(true);
        h.submit(Command::StartScan {
            duration: Duration::from_secs(1),
        })
        .unwrap();
        h.drain();

        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert_eq!(
            h.take_events(),
            vec![SessionEvent::ScanCompleted { devices: vec![] }]
        );
    }

    // --- Connecting ---

    #[test]
    fn test_connect_rejects_empty_address() {
        let mut h = Harness::new();
        assert!(matches!(
            h.submit(Command::Connect {
                address: "  ".to_string()
            }),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(h.mock.open_count(), 0);
    }

    #[test]
    fn test_connect_rejects_missing_adapter() {
        let mut h = Harness::new();
        h.mock.set_available(false);
        assert!(matches!(
            h.submit(Command::Connect {
                address: ADDR.to_string()
            }),
            Err(Error::TransportUnavailable)
        ));
    }

    #[test]
    fn test_full_handshake() {
        let mut h = Harness::new();
        h.connect();
        assert_eq!(h.machine.state(), ControllerState::Connecting);
        assert_eq!(h.mock.open_count(), 1);

        h.event(connected(ADDR));
        assert_eq!(h.machine.state(), ControllerState::Connecting);
        h.drain();
        assert_eq!(h.machine.state(), ControllerState::ServicesDiscovering);

        h.event(discovered(ADDR, GattStatus::SUCCESS));
        assert_eq!(h.machine.state(), ControllerState::NegotiatingMtu);
        h.drain();

        assert_eq!(h.mock.notification_enables(), vec![device_name(), battery()]);
        assert_eq!(h.mock.mtu_requests(), vec![512]);

        h.event(mtu_changed(ADDR, 512));
        assert_eq!(h.machine.state(), ControllerState::Ready);
        assert_eq!(h.machine.mtu(), Some(512));
        assert_eq!(h.machine.services().len(), 2);
        assert_eq!(h.machine.device().map(|d| d.address.as_str()), Some(ADDR));

        let events = h.take_events();
        assert_eq!(
            events.last(),
            Some(&SessionEvent::ConnectionReady {
                device: DeviceRecord::new(ADDR, None),
                mtu: 512
            })
        );
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ControllerState::Connecting,
                ControllerState::ServicesDiscovering,
                ControllerState::NegotiatingMtu,
                ControllerState::Ready,
            ]
        );
    }

    #[test]
    fn test_connection_ready_uses_scanned_name() {
        let mut h = Harness::new();
        h.submit(Command::StartScan {
            duration: Duration::from_secs(1),
        })
        .unwrap();
        h.drain();
        h.mock.advertise(ScanResult::new(ADDR, Some("Band")));
        h.advance(Duration::from_secs(1));

        h.connect_ready();
        assert_eq!(
            h.machine.device().and_then(|d| d.name.as_deref()),
            Some("Band")
        );
    }

    #[test]
    fn test_mtu_shortfall_fails_and_releases() {
        let mut h = Harness::new();
        h.connect();
        h.event(connected(ADDR));
        h.drain();
        h.event(discovered(ADDR, GattStatus::SUCCESS));
        h.drain();
        h.take_events();

        h.event(mtu_changed(ADDR, 256));
        assert_eq!(h.machine.state(), ControllerState::Failed);
        assert_eq!(h.mock.close_count(), 1);
        assert!(h.machine.mtu().is_none());

        let events = h.take_events();
        assert!(matches!(
            events.first(),
            Some(SessionEvent::ConnectionFailed { address, .. }) if address == ADDR
        ));
    }

    #[test]
    fn test_mtu_at_least_policy_accepts_partial_upgrade() {
        let mut h = Harness::with_config(
            ControllerConfig::default()
                .settle_interval(SETTLE)
                .mtu_policy(MtuPolicy::AtLeast(185)),
        );
        h.connect();
        h.event(connected(ADDR));
        h.drain();
        h.event(discovered(ADDR, GattStatus::SUCCESS));
        h.drain();
        h.event(mtu_changed(ADDR, 247));

        assert_eq!(h.machine.state(), ControllerState::Ready);
        assert_eq!(h.machine.mtu(), Some(247));
    }

    #[test]
    fn test_discovery_failure_fails_and_releases() {
        let mut h = Harness::new();
        h.connect();
        h.event(connected(ADDR));
        h.drain();
        h.event(discovered(ADDR, GattStatus::FAILURE));

        assert_eq!(h.machine.state(), ControllerState::Failed);
        assert_eq!(h.mock.close_count(), 1);
        assert!(h.mock.mtu_requests().is_empty());
    }

    #[test]
    fn test_failed_open_reports_failure() {
        let mut h = Harness::new();
        h.mock.set_fail_open(true);
        h.connect();

        assert_eq!(h.machine.state(), ControllerState::Failed);
        assert!(
            h.take_events()
                .iter()
                .any(|e| matches!(e, SessionEvent::ConnectionFailed { .. }))
        );
    }

    #[test]
    fn test_connect_same_address_reuses_handle() {
        let mut h = Harness::new();
        h.connect_ready();

        h.connect();
        h.connect();
        assert_eq!(h.mock.open_count(), 1);
        assert_eq!(h.mock.reconnect_count(), 2);
        assert_eq!(h.machine.state(), ControllerState::Ready);
    }

    #[test]
    fn test_failed_reactivation_returns_to_idle() {
        let mut h = Harness::new();
        h.connect();
        h.mock.set_fail_reconnect(true);
        h.connect();

        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert_eq!(h.mock.close_count(), 1);
        assert_eq!(h.mock.open_count(), 1);
    }

    #[test]
    fn test_connect_other_address_releases_previous() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(Command::Connect {
            address: "BB:BB".to_string(),
        })
        .unwrap();
        h.drain();

        assert_eq!(h.mock.open_count(), 2);
        assert_eq!(h.mock.close_count(), 1);
        assert_eq!(h.machine.state(), ControllerState::Connecting);

        // The old peripheral's events are absorbed.
        h.event(mtu_changed(ADDR, 512));
        assert_eq!(h.machine.state(), ControllerState::Connecting);
    }

    #[test]
    fn test_stale_handshake_command_is_dropped() {
        let mut h = Harness::new();
        h.connect();
        h.submit(Command::Connect {
            address: "BB:BB".to_string(),
        })
        .unwrap();
        // Discovery for the first session lands behind the second connect.
        h.event(connected(ADDR));
        h.drain();

        assert!(!h.mock.calls().contains(&MockCall::DiscoverServices));
        assert_eq!(h.machine.state(), ControllerState::Connecting);
        assert_eq!(h.mock.open_count(), 2);
    }

    // --- Disconnecting ---

    #[test]
    fn test_remote_disconnect_releases_once() {
        let mut h = Harness::new();
        h.connect_ready();

        h.event(disconnected(ADDR));
        h.event(disconnected(ADDR));

        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert_eq!(h.mock.close_count(), 1);
        let events = h.take_events();
        let disconnects = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_disconnect_during_handshake_reports_failure() {
        let mut h = Harness::new();
        h.connect();
        h.event(disconnected(ADDR));

        assert_eq!(h.machine.state(), ControllerState::Idle);
        let events = h.take_events();
        let failed = events
            .iter()
            .position(|e| matches!(e, SessionEvent::ConnectionFailed { .. }));
        let gone = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Disconnected { .. }));
        assert!(failed.is_some() && gone.is_some());
        assert!(failed < gone);
    }

    #[test]
    fn test_orderly_disconnect() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(Command::Disconnect).unwrap();
        h.drain();
        assert_eq!(h.machine.state(), ControllerState::Disconnecting);

        h.event(disconnected(ADDR));
        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert!(
            h.take_events()
                .contains(&SessionEvent::Disconnected { address: ADDR.to_string() })
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(Command::Close).unwrap();
        h.submit(Command::Close).unwrap();
        h.drain();

        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert_eq!(h.mock.close_count(), 1);
        assert!(h.machine.services().is_empty());
    }

    #[test]
    fn test_late_event_without_session_is_absorbed() {
        let mut h = Harness::new();
        h.event(connected(ADDR));
        h.event(mtu_changed(ADDR, 512));
        assert_eq!(h.machine.state(), ControllerState::Idle);
        assert!(h.take_events().is_empty());
    }

    // --- Reads and writes ---

    #[test]
    fn test_empty_write_is_noop() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(write(battery(), &[])).unwrap();
        h.drain();
        assert!(h.mock.writes().is_empty());
        assert!(h.take_events().is_empty());
    }

    #[test]
    fn test_write_without_session_is_noop() {
        let mut h = Harness::new();
        h.submit(write(battery(), &[1])).unwrap();
        h.drain();
        assert!(h.mock.writes().is_empty());
    }

    #[test]
    fn test_write_before_ready_is_rejected() {
        let mut h = Harness::new();
        h.connect();
        assert!(matches!(
            h.submit(write(battery(), &[1])),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_write_unknown_characteristic_is_rejected() {
        let mut h = Harness::new();
        h.connect_ready();
        let unknown = CharacteristicAddress::new(BATTERY_SERVICE, DEVICE_NAME);
        assert!(matches!(
            h.submit(write(unknown, &[1])),
            Err(Error::CharacteristicNotFound { .. })
        ));
        assert!(matches!(
            h.submit(Command::Read { target: unknown }),
            Err(Error::CharacteristicNotFound { .. })
        ));
    }

    #[test]
    fn test_writes_never_overlap() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(write(battery(), &[1])).unwrap();
        h.submit(write(device_name(), b"hi")).unwrap();
        h.submit(Command::Read { target: battery() }).unwrap();
        h.drain();
        assert_eq!(h.mock.writes(), vec![(battery(), vec![1])]);

        h.event(written(ADDR, battery()));
        assert_eq!(h.mock.writes().len(), 2);
        assert!(h.mock.reads().is_empty());

        h.event(written(ADDR, device_name()));
        assert_eq!(h.mock.reads(), vec![battery()]);

        let events = h.take_events();
        assert_eq!(
            events,
            vec![
                SessionEvent::CharacteristicWritten {
                    target: battery(),
                    status: GattStatus::SUCCESS
                },
                SessionEvent::CharacteristicWritten {
                    target: device_name(),
                    status: GattStatus::SUCCESS
                },
            ]
        );
    }

    #[test]
    fn test_read_completion_does_not_release_pending_write() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(write(battery(), &[1])).unwrap();
        h.submit(write(battery(), &[2])).unwrap();
        h.drain();
        assert_eq!(h.mock.writes(), vec![(battery(), vec![1])]);

        h.event(GattEvent::CharacteristicRead {
            address: ADDR.to_string(),
            target: battery(),
            value: vec![0],
            status: GattStatus::SUCCESS,
        });
        assert_eq!(h.mock.writes().len(), 1);

        h.event(written(ADDR, battery()));
        assert_eq!(
            h.mock.writes(),
            vec![(battery(), vec![1]), (battery(), vec![2])]
        );
    }

    #[test]
    fn test_write_completion_does_not_release_pending_read() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(Command::Read { target: battery() }).unwrap();
        h.submit(write(battery(), &[1])).unwrap();
        h.drain();
        assert_eq!(h.mock.reads(), vec![battery()]);

        h.event(written(ADDR, battery()));
        assert!(h.mock.writes().is_empty());
    }

    #[test]
    fn test_read_completion_and_notification() {
        let mut h = Harness::new();
        h.connect_ready();

        h.submit(Command::Read { target: battery() }).unwrap();
        h.drain();
        h.event(GattEvent::CharacteristicRead {
            address: ADDR.to_string(),
            target: battery(),
            value: vec![87],
            status: GattStatus::SUCCESS,
        });
        h.event(GattEvent::CharacteristicChanged {
            address: ADDR.to_string(),
            target: battery(),
            value: vec![86],
        });

        assert_eq!(
            h.take_events(),
            vec![
                SessionEvent::CharacteristicRead {
                    target: battery(),
                    value: vec![87],
                    status: GattStatus::SUCCESS
                },
                SessionEvent::CharacteristicChanged {
                    target: battery(),
                    value: vec![86]
                },
            ]
        );
    }

    #[test]
    fn test_event_sink_swap() {
        let mut h = Harness::new();
        let previous = h.machine.set_event_sink(None);
        assert!(previous.is_some());

        h.connect();
        assert!(h.take_events().is_empty());

        let (tx, mut rx) = event_channel(8);
        h.machine.set_event_sink(Some(tx));
        h.event(disconnected(ADDR));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ConnectionFailed { .. })));
    }

    #[test]
    fn test_watch_state_follows_transitions() {
        let mut h = Harness::new();
        let watch = h.machine.watch_state();
        h.connect();
        assert_eq!(*watch.borrow(), ControllerState::Connecting);

        h.machine.shutdown();
        assert_eq!(*watch.borrow(), ControllerState::Idle);
        assert_eq!(h.mock.close_count(), 1);
    }
}
