//! Controller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scan::{DedupPolicy, ScanSettings};

/// Default delay between consecutive control-plane commands.
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_millis(10);

/// Longest accepted delay between consecutive control-plane commands.
pub const MAX_SETTLE_INTERVAL: Duration = Duration::from_secs(10);

/// Default MTU requested once services are discovered.
pub const DEFAULT_TARGET_MTU: u16 = 512;

/// Largest ATT MTU a central may request.
pub const MAX_ATT_MTU: u16 = 517;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Rule deciding whether a negotiated MTU completes the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtuPolicy {
    /// The negotiated MTU must equal the requested one.
    #[default]
    Exact,
    /// Any negotiated MTU of at least this value is accepted.
    AtLeast(u16),
}

impl MtuPolicy {
    /// Whether `negotiated` satisfies this policy for a request of `requested`.
    pub fn accepts(self, requested: u16, negotiated: u16) -> bool {
        match self {
            Self::Exact => negotiated == requested,
            Self::AtLeast(floor) => negotiated >= floor,
        }
    }
}

/// Configuration for [`BleCentralController`](crate::BleCentralController).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use blecentral_core::{ControllerConfig, MtuPolicy};
///
/// let config = ControllerConfig::default()
///     .settle_interval(Duration::from_millis(20))
///     .mtu_policy(MtuPolicy::AtLeast(185));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Minimum spacing between issued commands. Zero disables throttling.
    pub settle_interval: Duration,
    /// MTU requested after service discovery.
    pub target_mtu: u16,
    /// Acceptance rule for the negotiated MTU.
    pub mtu_policy: MtuPolicy,
    /// Settings passed to the scanner.
    pub scan_settings: ScanSettings,
    /// Dedup policy for regular scan results.
    pub dedup: DedupPolicy,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settle_interval: DEFAULT_SETTLE_INTERVAL,
            target_mtu: DEFAULT_TARGET_MTU,
            mtu_policy: MtuPolicy::Exact,
            scan_settings: ScanSettings::default(),
            dedup: DedupPolicy::ByAddress,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ControllerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the settle interval between commands.
    #[must_use]
    pub fn settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }

    /// Set the MTU requested after discovery.
    #[must_use]
    pub fn target_mtu(mut self, mtu: u16) -> Self {
        self.target_mtu = mtu;
        self
    }

    /// Set the MTU acceptance policy.
    #[must_use]
    pub fn mtu_policy(mut self, policy: MtuPolicy) -> Self {
        self.mtu_policy = policy;
        self
    }

    /// Set the scanner settings.
    #[must_use]
    pub fn scan_settings(mut self, settings: ScanSettings) -> Self {
        self.scan_settings = settings;
        self
    }

    /// Set the scan result dedup policy.
    #[must_use]
    pub fn dedup(mut self, policy: DedupPolicy) -> Self {
        self.dedup = policy;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check the configuration for values the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.target_mtu == 0 {
            return Err(Error::invalid_config("target MTU must be greater than zero"));
        }
        if self.target_mtu > MAX_ATT_MTU {
            return Err(Error::invalid_config(format!(
                "target MTU {} exceeds the ATT maximum of {}",
                self.target_mtu, MAX_ATT_MTU
            )));
        }
        if let MtuPolicy::AtLeast(floor) = self.mtu_policy
            && (floor == 0 || floor > self.target_mtu)
        {
            return Err(Error::invalid_config(format!(
                "MTU floor {} must be between 1 and the target MTU {}",
                floor, self.target_mtu
            )));
        }
        if self.settle_interval > MAX_SETTLE_INTERVAL {
            return Err(Error::invalid_config(format!(
                "settle interval {:?} exceeds the maximum of {:?}",
                self.settle_interval, MAX_SETTLE_INTERVAL
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event capacity must be greater than zero"));
        }
        Ok(())
    }
}
