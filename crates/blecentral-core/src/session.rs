//! The single active connection context.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use blecentral_types::{CharacteristicAddress, DeviceRecord, GattCharacteristic, GattService, WriteType};

use crate::transport::GattLink;

/// Identifies one session. Handshake commands carry it so that commands
/// scheduled for a released session are discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A characteristic operation that completes through a GATT callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    Read {
        target: CharacteristicAddress,
    },
    Write {
        target: CharacteristicAddress,
        value: Vec<u8>,
        write_type: WriteType,
    },
}

/// Which completion callback finishes a [`GattOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattOpKind {
    Read,
    Write,
}

impl fmt::Display for GattOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

impl GattOp {
    pub fn target(&self) -> &CharacteristicAddress {
        match self {
            Self::Read { target } | Self::Write { target, .. } => target,
        }
    }

    pub fn kind(&self) -> GattOpKind {
        match self {
            Self::Read { .. } => GattOpKind::Read,
            Self::Write { .. } => GattOpKind::Write,
        }
    }
}

/// Connection context owned by the state machine.
///
/// The link handle is held here and nowhere else; [`Session::release`]
/// closes it at most once.
pub struct Session<L: GattLink> {
    id: SessionId,
    device: DeviceRecord,
    link: Option<L>,
    mtu: Option<u16>,
    services: Vec<GattService>,
    catalog: BTreeMap<CharacteristicAddress, GattCharacteristic>,
    in_flight: Option<GattOp>,
    waiting: VecDeque<GattOp>,
}

impl<L: GattLink> fmt::Debug for Session<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("has_link", &self.link.is_some())
            .field("mtu", &self.mtu)
            .field("characteristics", &self.catalog.len())
            .field("in_flight", &self.in_flight)
            .field("waiting", &self.waiting.len())
            .finish()
    }
}

impl<L: GattLink> Session<L> {
    pub fn new(id: SessionId, device: DeviceRecord, link: L) -> Self {
        Self {
            id,
            device,
            link: Some(link),
            mtu: None,
            services: Vec::new(),
            catalog: BTreeMap::new(),
            in_flight: None,
            waiting: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    pub fn link_mut(&mut self) -> Option<&mut L> {
        self.link.as_mut()
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// Close and drop the link handle. Returns `false` if it was already
    /// released.
    pub fn release(&mut self) -> bool {
        self.in_flight = None;
        self.waiting.clear();
        match self.link.take() {
            Some(mut link) => {
                link.close();
                true
            }
            None => false,
        }
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = Some(mtu);
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    /// Store the discovered services and index every characteristic.
    pub fn set_services(&mut self, services: Vec<GattService>) {
        self.catalog = services
            .iter()
            .flat_map(|service| {
                service
                    .characteristics
                    .iter()
                    .map(|c| (CharacteristicAddress::new(service.uuid, c.uuid), c.clone()))
            })
            .collect();
        self.services = services;
    }

    pub fn characteristic(&self, target: &CharacteristicAddress) -> Option<&GattCharacteristic> {
        self.catalog.get(target)
    }

    /// Every characteristic address in discovery order.
    pub fn characteristic_addresses(&self) -> Vec<CharacteristicAddress> {
        self.services.iter().flat_map(GattService::addresses).collect()
    }

    pub fn in_flight(&self) -> Option<&GattOp> {
        self.in_flight.as_ref()
    }

    pub fn set_in_flight(&mut self, op: GattOp) {
        self.in_flight = Some(op);
    }

    /// Clear the in-flight operation if it is a `kind` operation on `target`.
    pub fn complete(&mut self, kind: GattOpKind, target: &CharacteristicAddress) -> Option<GattOp> {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|op| op.kind() == kind && op.target() == target)
        {
            self.in_flight.take()
        } else {
            None
        }
    }

    pub fn enqueue(&mut self, op: GattOp) {
        self.waiting.push_back(op);
    }

    pub fn next_waiting(&mut self) -> Option<GattOp> {
        self.waiting.pop_front()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}
