//! Mock transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without any BLE hardware. It
//! records every call it receives and lets tests inject advertisements and
//! GATT events.
//!
//! # Features
//!
//! - **Call log**: inspect exactly what the controller issued, in order
//! - **Auto-respond**: answer every request with a successful GATT event
//! - **Failure injection**: make scanning, opening or reconnecting fail
//!
//! # Example
//!
//! ```
//! use blecentral_core::{MockCall, MockTransport, Transport};
//!
//! let mut transport = MockTransport::builder().auto_respond(true).build();
//! assert!(transport.is_available());
//! transport.stop_scan().unwrap();
//! assert_eq!(transport.calls(), vec![MockCall::StopScan]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use blecentral_types::{
    CharacteristicAddress, ConnectionState, GattService, GattStatus, ScanCallbackType, ScanResult,
    WriteType,
};

use crate::callback::{GattCallback, GattEvent};
use crate::config::MAX_ATT_MTU;
use crate::error::{Error, Result};
use crate::scan::{ScanResultAggregator, ScanSettings};
use crate::transport::{GattLink, Transport};

/// A call recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    StartScan,
    StopScan,
    Open { address: String, auto_connect: bool },
    Reconnect,
    Disconnect,
    Close,
    DiscoverServices,
    EnableNotifications(CharacteristicAddress),
    RequestMtu(u16),
    Read(CharacteristicAddress),
    Write {
        target: CharacteristicAddress,
        value: Vec<u8>,
        write_type: WriteType,
    },
}

struct MockState {
    available: AtomicBool,
    auto_respond: AtomicBool,
    fail_scan: AtomicBool,
    fail_open: AtomicBool,
    fail_reconnect: AtomicBool,
    /// Largest MTU the simulated peripheral agrees to.
    max_mtu: AtomicU16,
    services: Mutex<Vec<GattService>>,
    read_values: Mutex<HashMap<CharacteristicAddress, Vec<u8>>>,
    calls: Mutex<Vec<MockCall>>,
    scanner: Mutex<Option<Arc<ScanResultAggregator>>>,
    callback: Mutex<Option<Arc<GattCallback>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockState {
    fn record(&self, call: MockCall) {
        trace!(?call, "Mock call");
        lock(&self.calls).push(call);
    }

    fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| predicate(c)).count()
    }

    fn find_characteristic(&self, target: &CharacteristicAddress) -> Option<bool> {
        lock(&self.services)
            .iter()
            .filter(|s| s.uuid == target.service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == target.characteristic)
            .map(|c| c.has_notification_descriptor())
    }
}

/// A BLE transport double.
///
/// Clones share state, so a test can keep one clone for inspection while the
/// controller owns another.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("available", &self.state.available.load(Ordering::Relaxed))
            .field("auto_respond", &self.state.auto_respond.load(Ordering::Relaxed))
            .field("calls", &lock(&self.state.calls).len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// An available adapter with no services that never responds on its own.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    // --- Configuration ---

    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Relaxed);
    }

    pub fn set_auto_respond(&self, enabled: bool) {
        self.state.auto_respond.store(enabled, Ordering::Relaxed);
    }

    pub fn set_fail_scan(&self, fail: bool) {
        self.state.fail_scan.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_reconnect(&self, fail: bool) {
        self.state.fail_reconnect.store(fail, Ordering::Relaxed);
    }

    /// Cap the MTU the peripheral agrees to.
    pub fn set_max_mtu(&self, mtu: u16) {
        self.state.max_mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        *lock(&self.state.services) = services;
    }

    /// Value returned by auto-responded reads of `target`.
    pub fn set_read_value(&self, target: CharacteristicAddress, value: Vec<u8>) {
        lock(&self.state.read_values).insert(target, value);
    }

    // --- Injection ---

    /// Deliver an advertisement to the running scan.
    pub fn advertise(&self, result: ScanResult) -> bool {
        self.advertise_as(result, ScanCallbackType::AllMatches)
    }

    pub fn advertise_as(&self, result: ScanResult, callback_type: ScanCallbackType) -> bool {
        match lock(&self.state.scanner).as_ref() {
            Some(scanner) => scanner.on_advertisement(result, callback_type),
            None => false,
        }
    }

    /// Deliver a batch of results to the running scan.
    pub fn batch(&self, results: Vec<ScanResult>) -> usize {
        match lock(&self.state.scanner).as_ref() {
            Some(scanner) => scanner.on_batch(results),
            None => 0,
        }
    }

    /// Dispatch `event` through the callback of the most recently opened link.
    pub fn emit(&self, event: GattEvent) {
        let callback = lock(&self.state.callback).clone();
        if let Some(callback) = callback {
            callback.dispatch(event);
        }
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self, address: &str) {
        self.emit(GattEvent::ConnectionStateChanged {
            address: address.to_string(),
            status: GattStatus(0x08),
            state: ConnectionState::Disconnected,
        });
    }

    /// Simulate a notification from the peripheral.
    pub fn notify(&self, address: &str, target: CharacteristicAddress, value: Vec<u8>) {
        self.emit(GattEvent::CharacteristicChanged {
            address: address.to_string(),
            target,
            value,
        });
    }

    // --- Inspection ---

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state.calls).clear();
    }

    pub fn scan_starts(&self) -> usize {
        self.state.count(|c| matches!(c, MockCall::StartScan))
    }

    pub fn scan_stops(&self) -> usize {
        self.state.count(|c| matches!(c, MockCall::StopScan))
    }

    pub fn open_count(&self) -> usize {
        self.state.count(|c| matches!(c, MockCall::Open { .. }))
    }

    pub fn reconnect_count(&self) -> usize {
        self.state.count(|c| matches!(c, MockCall::Reconnect))
    }

    pub fn close_count(&self) -> usize {
        self.state.count(|c| matches!(c, MockCall::Close))
    }

    /// Every notification enable attempted, in order.
    pub fn notification_enables(&self) -> Vec<CharacteristicAddress> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|c| match c {
                MockCall::EnableNotifications(target) => Some(*target),
                _ => None,
            })
            .collect()
    }

    pub fn mtu_requests(&self) -> Vec<u16> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|c| match c {
                MockCall::RequestMtu(mtu) => Some(*mtu),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> Vec<CharacteristicAddress> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|c| match c {
                MockCall::Read(target) => Some(*target),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<(CharacteristicAddress, Vec<u8>)> {
        lock(&self.state.calls)
            .iter()
            .filter_map(|c| match c {
                MockCall::Write { target, value, .. } => Some((*target, value.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    type Link = MockLink;

    fn is_available(&self) -> bool {
        self.state.available.load(Ordering::Relaxed)
    }

    fn start_scan(
        &mut self,
        _settings: &ScanSettings,
        results: Arc<ScanResultAggregator>,
    ) -> Result<()> {
        self.state.record(MockCall::StartScan);
        if self.state.fail_scan.load(Ordering::Relaxed) {
            return Err(Error::operation_failed("start scan", GattStatus::FAILURE));
        }
        *lock(&self.state.scanner) = Some(results);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.state.record(MockCall::StopScan);
        *lock(&self.state.scanner) = None;
        Ok(())
    }

    fn open(
        &mut self,
        address: &str,
        auto_connect: bool,
        callback: Arc<GattCallback>,
    ) -> Result<MockLink> {
        self.state.record(MockCall::Open {
            address: address.to_string(),
            auto_connect,
        });
        if self.state.fail_open.load(Ordering::Relaxed) {
            return Err(Error::operation_failed("open", GattStatus::FAILURE));
        }
        *lock(&self.state.callback) = Some(Arc::clone(&callback));

        let link = MockLink {
            address: address.to_string(),
            state: Arc::clone(&self.state),
            callback,
            closed: false,
        };
        link.connected();
        Ok(link)
    }
}

/// Link handle produced by [`MockTransport`].
pub struct MockLink {
    address: String,
    state: Arc<MockState>,
    callback: Arc<GattCallback>,
    closed: bool,
}

impl fmt::Debug for MockLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockLink")
            .field("address", &self.address)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MockLink {
    fn respond(&self, event: GattEvent) {
        if !self.closed && self.state.auto_respond.load(Ordering::Relaxed) {
            self.callback.dispatch(event);
        }
    }

    fn connected(&self) {
        self.respond(GattEvent::ConnectionStateChanged {
            address: self.address.clone(),
            status: GattStatus::SUCCESS,
            state: ConnectionState::Connected,
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }
}

impl GattLink for MockLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn reconnect(&mut self) -> Result<()> {
        self.state.record(MockCall::Reconnect);
        self.ensure_open()?;
        if self.state.fail_reconnect.load(Ordering::Relaxed) {
            return Err(Error::operation_failed("reconnect", GattStatus::FAILURE));
        }
        self.connected();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.state.record(MockCall::Disconnect);
        self.ensure_open()?;
        self.respond(GattEvent::ConnectionStateChanged {
            address: self.address.clone(),
            status: GattStatus::SUCCESS,
            state: ConnectionState::Disconnected,
        });
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.state.record(MockCall::Close);
            self.closed = true;
        }
    }

    fn discover_services(&mut self) -> Result<()> {
        self.state.record(MockCall::DiscoverServices);
        self.ensure_open()?;
        self.respond(GattEvent::ServicesDiscovered {
            address: self.address.clone(),
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.state.services).clone()
    }

    fn enable_notifications(&mut self, target: &CharacteristicAddress) -> Result<()> {
        self.state.record(MockCall::EnableNotifications(*target));
        self.ensure_open()?;
        match self.state.find_characteristic(target) {
            Some(true) => Ok(()),
            Some(false) => Err(Error::unsupported(format!(
                "{} has no client characteristic configuration descriptor",
                target
            ))),
            None => Err(Error::characteristic_not_found(*target)),
        }
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<()> {
        self.state.record(MockCall::RequestMtu(mtu));
        self.ensure_open()?;
        let granted = mtu.min(self.state.max_mtu.load(Ordering::Relaxed));
        self.respond(GattEvent::MtuChanged {
            address: self.address.clone(),
            mtu: granted,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn read_characteristic(&mut self, target: &CharacteristicAddress) -> Result<()> {
        self.state.record(MockCall::Read(*target));
        self.ensure_open()?;
        let value = lock(&self.state.read_values)
            .get(target)
            .cloned()
            .unwrap_or_default();
        self.respond(GattEvent::CharacteristicRead {
            address: self.address.clone(),
            target: *target,
            value,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        target: &CharacteristicAddress,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.state.record(MockCall::Write {
            target: *target,
            value: value.to_vec(),
            write_type,
        });
        self.ensure_open()?;
        self.respond(GattEvent::CharacteristicWritten {
            address: self.address.clone(),
            target: *target,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockTransportBuilder {
    available: bool,
    auto_respond: bool,
    max_mtu: u16,
    services: Vec<GattService>,
    read_values: HashMap<CharacteristicAddress, Vec<u8>>,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self {
            available: true,
            auto_respond: false,
            max_mtu: MAX_ATT_MTU,
            services: Vec::new(),
            read_values: HashMap::new(),
        }
    }
}

impl MockTransportBuilder {
    /// Simulate a host with no adapter.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Answer every request with a successful event.
    #[must_use]
    pub fn auto_respond(mut self, enabled: bool) -> Self {
        self.auto_respond = enabled;
        self
    }

    #[must_use]
    pub fn max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    #[must_use]
    pub fn services(mut self, services: Vec<GattService>) -> Self {
        self.services = services;
        self
    }

    #[must_use]
    pub fn service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    #[must_use]
    pub fn read_value(mut self, target: CharacteristicAddress, value: Vec<u8>) -> Self {
        self.read_values.insert(target, value);
        self
    }

    pub fn build(self) -> MockTransport {
        MockTransport {
            state: Arc::new(MockState {
                available: AtomicBool::new(self.available),
                auto_respond: AtomicBool::new(self.auto_respond),
                fail_scan: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
                fail_reconnect: AtomicBool::new(false),
                max_mtu: AtomicU16::new(self.max_mtu),
                services: Mutex::new(self.services),
                read_values: Mutex::new(self.read_values),
                calls: Mutex::new(Vec::new()),
                scanner: Mutex::new(None),
                callback: Mutex::new(None),
            }),
        }
    }
}
