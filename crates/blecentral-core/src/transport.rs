//! Transport abstraction.
//!
//! A [`Transport`] is the adapter-level handle: it scans and opens links.
//! A [`GattLink`] is one connection to one peripheral. Both only *issue*
//! work and return immediately; outcomes arrive later as
//! [`GattEvent`](crate::callback::GattEvent)s through the
//! [`GattCallback`] handed to [`Transport::open`].
//!
//! Errors returned from these methods mean the request could not even be
//! issued.

use std::sync::Arc;

use blecentral_types::{CharacteristicAddress, GattService, WriteType};

use crate::callback::GattCallback;
use crate::error::Result;
use crate::scan::{ScanResultAggregator, ScanSettings};

/// Adapter-level BLE operations.
pub trait Transport: Send + 'static {
    /// Per-connection handle type.
    type Link: GattLink;

    /// Whether a powered adapter is present.
    fn is_available(&self) -> bool;

    /// Start discovery, feeding advertisements into `results`.
    fn start_scan(&mut self, settings: &ScanSettings, results: Arc<ScanResultAggregator>)
    -> Result<()>;

    /// Stop discovery. Stopping an idle scanner is not an error.
    fn stop_scan(&mut self) -> Result<()>;

    /// Open a link to `address`, reporting its outcomes through `callback`.
    fn open(
        &mut self,
        address: &str,
        auto_connect: bool,
        callback: Arc<GattCallback>,
    ) -> Result<Self::Link>;
}

/// One GATT connection.
pub trait GattLink: Send + 'static {
    /// Address of the peripheral this link belongs to.
    fn address(&self) -> &str;

    /// Re-activate the link after a disconnect.
    fn reconnect(&mut self) -> Result<()>;

    /// Begin an orderly disconnect.
    fn disconnect(&mut self) -> Result<()>;

    /// Release the link. No further events are reported after this.
    fn close(&mut self);

    /// Begin service discovery.
    fn discover_services(&mut self) -> Result<()>;

    /// Services found by the last successful discovery.
    fn services(&self) -> Vec<GattService>;

    /// Enable notifications on `target`.
    ///
    /// Returns [`Error::Unsupported`](crate::Error::Unsupported) when the
    /// characteristic has no notification descriptor.
    fn enable_notifications(&mut self, target: &CharacteristicAddress) -> Result<()>;

    /// Begin an MTU exchange.
    fn request_mtu(&mut self, mtu: u16) -> Result<()>;

    /// Begin a characteristic read.
    fn read_characteristic(&mut self, target: &CharacteristicAddress) -> Result<()>;

    /// Begin a characteristic write.
    fn write_characteristic(
        &mut self,
        target: &CharacteristicAddress,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;
}
