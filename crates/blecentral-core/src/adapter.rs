//! btleplug-backed transport.
//!
//! btleplug exposes an async API while [`Transport`] and [`GattLink`] only
//! issue work. Every request therefore spawns a task on the current tokio
//! runtime, and the task reports its outcome through the link's
//! [`GattCallback`].
//!
//! # Platform notes
//!
//! - On macOS peripherals are identified by a CoreBluetooth UUID instead of
//!   a MAC address; see [`create_identifier`].
//! - btleplug has no MTU exchange API. The operating system negotiates the
//!   MTU on connect, so [`GattLink::request_mtu`] acknowledges the requested
//!   value.
//! - Scan modes are advisory; btleplug scans with platform defaults.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use blecentral_types::{
    CharacteristicAddress, CharacteristicProperties, ConnectionState, GattCharacteristic,
    GattService, GattStatus, ScanCallbackType, ScanResult, WriteType,
};

use crate::callback::{GattCallback, GattEvent};
use crate::config::ControllerConfig;
use crate::controller::BleCentralController;
use crate::error::{Error, Result};
use crate::scan::{ScanResultAggregator, ScanSettings};
use crate::transport::{GattLink, Transport};
use crate::util::{addresses_match, create_identifier};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::TransportUnavailable)
}

fn runtime() -> Result<Handle> {
    Handle::try_current().map_err(|_| Error::unsupported("no tokio runtime is running"))
}

/// Transport over the host's first Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Option<Adapter>,
    scan: Option<CancellationToken>,
}

impl fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("available", &self.adapter.is_some())
            .field("scanning", &self.scan.is_some())
            .finish()
    }
}

impl BtleplugTransport {
    /// Look up the first adapter. A host without one yields an unavailable
    /// transport rather than an error.
    pub async fn new() -> Self {
        match get_adapter().await {
            Ok(adapter) => {
                info!("Bluetooth adapter found");
                Self::with_adapter(adapter)
            }
            Err(e) => {
                warn!(error = %e, "No usable Bluetooth adapter");
                Self::unavailable()
            }
        }
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter: Some(adapter),
            scan: None,
        }
    }

    /// A transport that reports no adapter.
    pub fn unavailable() -> Self {
        Self {
            adapter: None,
            scan: None,
        }
    }

    pub fn adapter(&self) -> Option<&Adapter> {
        self.adapter.as_ref()
    }

    /// Spawn a controller over the first adapter.
    pub async fn controller(config: ControllerConfig) -> Result<BleCentralController> {
        BleCentralController::spawn(Self::new().await, config)
    }

    fn require_adapter(&self) -> Result<Adapter> {
        self.adapter.clone().ok_or(Error::TransportUnavailable)
    }
}

impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    fn is_available(&self) -> bool {
        self.adapter.is_some()
    }

    fn start_scan(
        &mut self,
        settings: &ScanSettings,
        results: Arc<ScanResultAggregator>,
    ) -> Result<()> {
        let adapter = self.require_adapter()?;
        let runtime = runtime()?;
        self.stop_scan()?;

        let filter = ScanFilter {
            services: settings.service_filter.clone(),
        };
        let mode = settings.mode;
        let token = CancellationToken::new();
        let task_token = token.clone();

        runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe to adapter events");
                    return;
                }
            };
            if let Err(e) = adapter.start_scan(filter).await {
                warn!(error = %e, "Adapter refused to scan");
                return;
            }
            debug!(?mode, "Adapter scanning");

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    event = events.next() => {
                        let Some(event) = event else { break };
                        let Some(id) = advertised_peripheral(&event) else { continue };
                        if let Some(result) = scan_result(&adapter, id).await {
                            trace!(address = %result.address, rssi = ?result.rssi, "Advertisement");
                            results.on_advertisement(result, ScanCallbackType::AllMatches);
                        }
                    }
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                debug!(error = %e, "Failed to stop adapter scan");
            }
        });

        self.scan = Some(token);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        if let Some(token) = self.scan.take() {
            token.cancel();
        }
        Ok(())
    }

    fn open(
        &mut self,
        address: &str,
        auto_connect: bool,
        callback: Arc<GattCallback>,
    ) -> Result<BtleplugLink> {
        let adapter = self.require_adapter()?;
        let runtime = runtime()?;
        if auto_connect {
            debug!(%address, "Background connect is handled by the platform stack");
        }

        let link = BtleplugLink {
            context: LinkContext {
                address: address.to_string(),
                adapter,
                callback,
                peripheral: Arc::new(Mutex::new(None)),
                services: Arc::new(Mutex::new(Vec::new())),
                watching: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            },
            runtime,
            closed: false,
        };
        link.spawn_connect();
        Ok(link)
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(token) = self.scan.take() {
            token.cancel();
        }
    }
}

fn advertised_peripheral(event: &CentralEvent) -> Option<&PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

async fn scan_result(adapter: &Adapter, id: &PeripheralId) -> Option<ScanResult> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    Some(ScanResult {
        address: create_identifier(&properties.address.to_string(), &peripheral.id()),
        name: properties.local_name,
        rssi: properties.rssi,
        tx_power: properties.tx_power_level,
        manufacturer_data: properties.manufacturer_data.into_iter().collect(),
        service_data: properties.service_data.into_iter().collect(),
        services: properties.services,
    })
}

fn convert_services(services: BTreeSet<Service>) -> Vec<GattService> {
    services
        .into_iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    properties: CharacteristicProperties(c.properties.bits()),
                    descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect()
}

fn status_for(error: &btleplug::Error, denied: GattStatus) -> GattStatus {
    match error {
        btleplug::Error::PermissionDenied => denied,
        btleplug::Error::NotSupported(_) => GattStatus::REQUEST_NOT_SUPPORTED,
        _ => GattStatus::FAILURE,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a link and the tasks it spawns.
#[derive(Clone)]
struct LinkContext {
    address: String,
    adapter: Adapter,
    callback: Arc<GattCallback>,
    peripheral: Arc<Mutex<Option<Peripheral>>>,
    services: Arc<Mutex<Vec<GattService>>>,
    watching: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LinkContext {
    /// Deliver `event` unless the link has been closed.
    fn report(&self, event: GattEvent) {
        if self.cancel.is_cancelled() {
            trace!(kind = event.kind(), "Link closed, dropping event");
            return;
        }
        self.callback.dispatch(event);
    }

    fn report_state(&self, state: ConnectionState, status: GattStatus) {
        self.report(GattEvent::ConnectionStateChanged {
            address: self.address.clone(),
            status,
            state,
        });
    }

    fn peripheral(&self) -> Result<Peripheral> {
        lock(&self.peripheral).clone().ok_or(Error::NotConnected)
    }

    async fn find_peripheral(&self) -> Result<Peripheral> {
        if let Some(peripheral) = lock(&self.peripheral).clone() {
            return Ok(peripheral);
        }
        for peripheral in self.adapter.peripherals().await? {
            let address = peripheral.address().to_string();
            let identifier = create_identifier(&address, &peripheral.id());
            if addresses_match(&identifier, &self.address) {
                *lock(&self.peripheral) = Some(peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(Error::invalid_argument(format!(
            "peripheral {} has not been seen by the adapter",
            self.address
        )))
    }

    async fn connect(&self) -> Result<()> {
        let peripheral = self.find_peripheral().await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }
        if !self.watching.swap(true, Ordering::SeqCst) {
            self.watch(peripheral).await?;
        }
        Ok(())
    }

    /// Pump notifications and watch for the link dropping.
    async fn watch(&self, peripheral: Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let mut adapter_events = self.adapter.events().await?;
        let context = self.clone();
        let id = peripheral.id();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = context.cancel.cancelled() => break,
                    Some(notification) = notifications.next() => {
                        let service = lock(&context.services)
                            .iter()
                            .find(|s| s.characteristics.iter().any(|c| c.uuid == notification.uuid))
                            .map(|s| s.uuid);
                        match service {
                            Some(service) => context.report(GattEvent::CharacteristicChanged {
                                address: context.address.clone(),
                                target: CharacteristicAddress::new(service, notification.uuid),
                                value: notification.value,
                            }),
                            None => debug!(uuid = %notification.uuid, "Notification for unknown characteristic"),
                        }
                    }
                    Some(event) = adapter_events.next() => {
                        if let CentralEvent::DeviceDisconnected(gone) = event
                            && gone == id
                        {
                            info!(address = %context.address, "Peripheral disconnected");
                            context.report_state(ConnectionState::Disconnected, GattStatus::SUCCESS);
                        }
                    }
                    else => break,
                }
            }
            context.watching.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn find_characteristic(&self, target: &CharacteristicAddress) -> Result<Characteristic> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == target.service && c.uuid == target.characteristic)
            .ok_or_else(|| Error::characteristic_not_found(*target))
    }
}

/// One btleplug connection.
pub struct BtleplugLink {
    context: LinkContext,
    runtime: Handle,
    closed: bool,
}

impl fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("address", &self.context.address)
            .field("closed", &self.closed)
            .finish()
    }
}

impl BtleplugLink {
    fn spawn<F, Fut>(&self, task: F) -> Result<()>
    where
        F: FnOnce(LinkContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.closed {
            return Err(Error::NotConnected);
        }
        self.runtime.spawn(task(self.context.clone()));
        Ok(())
    }

    fn spawn_connect(&self) {
        let result = self.spawn(|ctx| async move {
            match ctx.connect().await {
                Ok(()) => {
                    debug!(address = %ctx.address, "Link up");
                    ctx.report_state(ConnectionState::Connected, GattStatus::SUCCESS);
                }
                Err(e) => {
                    warn!(address = %ctx.address, error = %e, "Connect failed");
                    ctx.report_state(ConnectionState::Disconnected, GattStatus::FAILURE);
                }
            }
        });
        if let Err(e) = result {
            debug!(error = %e, "Connect not issued");
        }
    }
}

impl GattLink for BtleplugLink {
    fn address(&self) -> &str {
        &self.context.address
    }

    fn reconnect(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        self.spawn_connect();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let peripheral = self.context.peripheral()?;
        self.spawn(|ctx| async move {
            let status = match peripheral.disconnect().await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!(address = %ctx.address, error = %e, "Disconnect failed");
                    GattStatus::FAILURE
                }
            };
            ctx.report_state(ConnectionState::Disconnected, status);
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.context.cancel.cancel();

        if let Some(peripheral) = lock(&self.context.peripheral).take() {
            let address = self.context.address.clone();
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(%address, error = %e, "Best-effort disconnect failed (device may already be disconnected)");
                } else {
                    debug!(%address, "Best-effort disconnect completed");
                }
            });
        }
    }

    fn discover_services(&mut self) -> Result<()> {
        let peripheral = self.context.peripheral()?;
        self.spawn(|ctx| async move {
            let status = match peripheral.discover_services().await {
                Ok(()) => {
                    *lock(&ctx.services) = convert_services(peripheral.services());
                    GattStatus::SUCCESS
                }
                Err(e) => {
                    warn!(address = %ctx.address, error = %e, "Service discovery failed");
                    status_for(&e, GattStatus::FAILURE)
                }
            };
            ctx.report(GattEvent::ServicesDiscovered {
                address: ctx.address.clone(),
                status,
            });
        })
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.context.services).clone()
    }

    fn enable_notifications(&mut self, target: &CharacteristicAddress) -> Result<()> {
        let notifiable = lock(&self.context.services)
            .iter()
            .filter(|s| s.uuid == target.service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == target.characteristic)
            .map(|c| c.has_notification_descriptor() || c.properties.can_notify())
            .ok_or_else(|| Error::characteristic_not_found(*target))?;
        if !notifiable {
            return Err(Error::unsupported(format!(
                "{} has no client characteristic configuration descriptor",
                target
            )));
        }

        let target = *target;
        self.spawn(move |ctx| async move {
            let result = async {
                let characteristic = ctx.find_characteristic(&target).await?;
                ctx.peripheral()?.subscribe(&characteristic).await?;
                Ok::<_, Error>(())
            };
            if let Err(e) = result.await {
                warn!(%target, error = %e, "Failed to subscribe");
            }
        })
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<()> {
        self.spawn(move |ctx| async move {
            ctx.report(GattEvent::MtuChanged {
                address: ctx.address.clone(),
                mtu,
                status: GattStatus::SUCCESS,
            });
        })
    }

    fn read_characteristic(&mut self, target: &CharacteristicAddress) -> Result<()> {
        let target = *target;
        self.spawn(move |ctx| async move {
            let result = async {
                let characteristic = ctx.find_characteristic(&target).await?;
                Ok::<_, Error>(ctx.peripheral()?.read(&characteristic).await?)
            };
            let (value, status) = match result.await {
                Ok(value) => (value, GattStatus::SUCCESS),
                Err(Error::Bluetooth(e)) => (Vec::new(), status_for(&e, GattStatus::READ_NOT_PERMITTED)),
                Err(_) => (Vec::new(), GattStatus::FAILURE),
            };
            ctx.report(GattEvent::CharacteristicRead {
                address: ctx.address.clone(),
                target,
                value,
                status,
            });
        })
    }

    fn write_characteristic(
        &mut self,
        target: &CharacteristicAddress,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let target = *target;
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };
        self.spawn(move |ctx| async move {
            let result = async {
                let characteristic = ctx.find_characteristic(&target).await?;
                ctx.peripheral()?
                    .write(&characteristic, &value, write_type)
                    .await?;
                Ok::<_, Error>(())
            };
            let status = match result.await {
                Ok(()) => GattStatus::SUCCESS,
                Err(Error::Bluetooth(e)) => status_for(&e, GattStatus::WRITE_NOT_PERMITTED),
                Err(_) => GattStatus::FAILURE,
            };
            ctx.report(GattEvent::CharacteristicWritten {
                address: ctx.address.clone(),
                target,
                status,
            });
        })
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                address = %self.context.address,
                "Link dropped without close() - performing best-effort cleanup"
            );
            self.close();
        }
    }
}
