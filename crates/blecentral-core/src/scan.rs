//! Scan result aggregation.
//!
//! Advertisements are delivered by the transport on its own scan task while
//! the scan window is closed by the controller, so the aggregator keeps both
//! accumulators behind a single lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use blecentral_types::{DeviceRecord, ScanCallbackType, ScanResult};

/// How regular (non-batch) scan results are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// One entry per address; the latest observation replaces the earlier one.
    #[default]
    ByAddress,
    /// Whole-value equality: distinct payloads from one address are kept.
    ByValue,
}

/// Radio duty cycle requested from the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Lowest power draw, slowest discovery.
    #[default]
    LowPower,
    /// Balanced power and latency.
    Balanced,
    /// Highest duty cycle.
    LowLatency,
}

/// Scanner settings handed to the transport when discovery starts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Radio duty cycle.
    pub mode: ScanMode,
    /// Only report peripherals advertising one of these services.
    /// Empty means no filter.
    pub service_filter: Vec<Uuid>,
}

impl ScanSettings {
    /// Create settings with defaults (low power, no filter).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan mode.
    #[must_use]
    pub fn mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a service UUID to the filter.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_filter.push(uuid);
        self
    }
}

/// Frozen view of one scan session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSnapshot {
    /// Regular results, deduplicated per the active [`DedupPolicy`], in
    /// first-seen order.
    pub regular: Vec<ScanResult>,
    /// Batch results in arrival order, never deduplicated.
    pub batch: Vec<ScanResult>,
}

impl ScanSnapshot {
    /// All devices seen, deduplicated by address.
    ///
    /// Regular results are merged first, so their names win over batch
    /// results for the same address.
    pub fn devices(&self) -> BTreeSet<DeviceRecord> {
        let mut devices = BTreeSet::new();
        for result in self.regular.iter().chain(&self.batch) {
            devices.insert(result.device());
        }
        devices
    }

    /// Whether nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.batch.is_empty()
    }
}

#[derive(Debug, Default)]
struct Accumulators {
    collecting: bool,
    regular: Vec<ScanResult>,
    by_address: HashMap<String, usize>,
    by_value: HashSet<ScanResult>,
    batch: Vec<ScanResult>,
}

impl Accumulators {
    fn clear(&mut self) {
        self.regular.clear();
        self.by_address.clear();
        self.by_value.clear();
        self.batch.clear();
    }

    fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            regular: self.regular.clone(),
            batch: self.batch.clone(),
        }
    }
}

/// Collects advertisements for the current scan window.
///
/// # Example
///
/// ```
/// use blecentral_core::scan::{DedupPolicy, ScanResultAggregator};
/// use blecentral_types::{ScanCallbackType, ScanResult};
///
/// let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
/// aggregator.start();
/// aggregator.on_advertisement(ScanResult::new("AA:AA", None).with_rssi(-70), ScanCallbackType::AllMatches);
/// aggregator.on_advertisement(ScanResult::new("AA:AA", None).with_rssi(-40), ScanCallbackType::AllMatches);
///
/// let snapshot = aggregator.stop();
/// assert_eq!(snapshot.regular.len(), 1);
/// assert_eq!(snapshot.regular[0].rssi, Some(-40));
/// ```
#[derive(Debug, Default)]
pub struct ScanResultAggregator {
    policy: DedupPolicy,
    inner: Mutex<Accumulators>,
}

impl ScanResultAggregator {
    /// Create an idle aggregator with the given dedup policy.
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Accumulators::default()),
        }
    }

    /// The dedup policy for regular results.
    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Accumulators> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear both accumulators and start collecting.
    pub fn start(&self) {
        let mut inner = self.lock();
        inner.clear();
        inner.collecting = true;
    }

    /// Record one advertisement.
    ///
    /// Only [`ScanCallbackType::AllMatches`] results are accumulated.
    /// Returns `true` if the result was stored.
    pub fn on_advertisement(&self, result: ScanResult, callback_type: ScanCallbackType) -> bool {
        if callback_type != ScanCallbackType::AllMatches {
            trace!(address = %result.address, ?callback_type, "Ignoring scan result");
            return false;
        }

        let mut inner = self.lock();
        if !inner.collecting {
            trace!(address = %result.address, "Scan window closed, dropping result");
            return false;
        }

        match self.policy {
            DedupPolicy::ByAddress => {
                if let Some(&index) = inner.by_address.get(&result.address) {
                    inner.regular[index] = result;
                } else {
                    let index = inner.regular.len();
                    inner.by_address.insert(result.address.clone(), index);
                    inner.regular.push(result);
                }
                true
            }
            DedupPolicy::ByValue => {
                if inner.by_value.insert(result.clone()) {
                    inner.regular.push(result);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Append a batch of results without deduplication.
    ///
    /// Returns the number of results stored.
    pub fn on_batch(&self, results: Vec<ScanResult>) -> usize {
        let mut inner = self.lock();
        if !inner.collecting {
            trace!(count = results.len(), "Scan window closed, dropping batch");
            return 0;
        }
        let count = results.len();
        inner.batch.extend(results);
        count
    }

    /// Stop collecting and return the frozen results.
    pub fn stop(&self) -> ScanSnapshot {
        let mut inner = self.lock();
        inner.collecting = false;
        inner.snapshot()
    }

    /// Current results without freezing.
    pub fn snapshot(&self) -> ScanSnapshot {
        self.lock().snapshot()
    }

    /// Whether a scan window is open.
    pub fn is_collecting(&self) -> bool {
        self.lock().collecting
    }
}

/// Address-deduplicated list of devices presented to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    devices: Vec<DeviceRecord>,
}

impl DeviceList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the list and repopulate it from `devices`.
    pub fn replace(&mut self, devices: impl IntoIterator<Item = DeviceRecord>) {
        self.devices.clear();
        for device in devices {
            self.push_unseen(device);
        }
    }

    /// Append devices from batch results whose address is not yet listed.
    ///
    /// Returns the number of devices added.
    pub fn extend(&mut self, results: &[ScanResult]) -> usize {
        results
            .iter()
            .filter(|result| self.push_unseen(result.device()))
            .count()
    }

    fn push_unseen(&mut self, device: DeviceRecord) -> bool {
        if self.contains(&device.address) {
            return false;
        }
        self.devices.push(device);
        true
    }

    /// Remove all devices.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Whether a device with this address is listed.
    pub fn contains(&self, address: &str) -> bool {
        self.devices.iter().any(|d| d.address == address)
    }

    /// Look up a device by address.
    pub fn get(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(address: &str, rssi: i16) -> ScanResult {
        ScanResult::new(address, Some("dev")).with_rssi(rssi)
    }

    #[test]
    fn test_start_clears_previous_session() {
        let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
        aggregator.start();
        aggregator.on_advertisement(adv("AA:AA", -50), ScanCallbackType::AllMatches);
        aggregator.on_batch(vec![adv("BB:BB", -60)]);
        aggregator.stop();

        aggregator.start();
        assert!(aggregator.snapshot().is_empty());
        assert!(aggregator.is_collecting());
    }

    #[test]
    fn test_only_all_matches_is_accumulated() {
        let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
        aggregator.start();

        assert!(!aggregator.on_advertisement(adv("AA:AA", -50), ScanCallbackType::FirstMatch));
        assert!(!aggregator.on_advertisement(adv("BB:BB", -50), ScanCallbackType::MatchLost));
        assert!(aggregator.on_advertisement(adv("CC:CC", -50), ScanCallbackType::AllMatches));

        let snapshot = aggregator.stop();
        assert_eq!(snapshot.regular.len(), 1);
        assert_eq!(snapshot.regular[0].address, "CC:CC");
    }

    #[test]
    fn test_by_address_latest_wins() {
        let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
        aggregator.start();
        aggregator.on_advertisement(adv("AA:AA", -80), ScanCallbackType::AllMatches);
        aggregator.on_advertisement(adv("BB:BB", -70), ScanCallbackType::AllMatches);
        aggregator.on_advertisement(adv("AA:AA", -40), ScanCallbackType::AllMatches);

        let snapshot = aggregator.stop();
        assert_eq!(snapshot.regular.len(), 2);
        assert_eq!(snapshot.regular[0].address, "AA:AA");
        assert_eq!(snapshot.regular[0].rssi, Some(-40));
    }

    #[test]
    fn test_by_value_keeps_distinct_payloads() {
        let aggregator = ScanResultAggregator::new(DedupPolicy::ByValue);
        aggregator.start();
        assert!(aggregator.on_advertisement(adv("AA:AA", -80), ScanCallbackType::AllMatches));
        assert!(aggregator.on_advertisement(adv("AA:AA", -40), ScanCallbackType::AllMatches));
        assert!(!aggregator.on_advertisement(adv("AA:AA", -40), ScanCallbackType::AllMatches));

        let snapshot = aggregator.stop();
        assert_eq!(snapshot.regular.len(), 2);
        assert_eq!(snapshot.devices().len(), 1);
    }

    #[test]
    fn test_batch_is_never_deduplicated() {
        let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
        aggregator.start();
        aggregator.on_batch(vec![adv("AA:AA", -50), adv("AA:AA", -50)]);
        aggregator.on_batch(vec![adv("AA:AA", -50)]);

        assert_eq!(aggregator.stop().batch.len(), 3);
    }

    #[test]
    fn test_frozen_aggregator_drops_results() {
        let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
        assert!(!aggregator.on_advertisement(adv("AA:AA", -50), ScanCallbackType::AllMatches));

        aggregator.start();
        aggregator.on_advertisement(adv("AA:AA", -50), ScanCallbackType::AllMatches);
        let frozen = aggregator.stop();

        assert!(!aggregator.on_advertisement(adv("BB:BB", -50), ScanCallbackType::AllMatches));
        assert_eq!(aggregator.on_batch(vec![adv("CC:CC", -50)]), 0);
        assert_eq!(aggregator.snapshot(), frozen);
    }

    #[test]
    fn test_snapshot_devices_prefers_regular_names() {
        let snapshot = ScanSnapshot {
            regular: vec![ScanResult::new("AA:AA", Some("Regular"))],
            batch: vec![
                ScanResult::new("AA:AA", Some("Batch")),
                ScanResult::new("BB:BB", None),
            ],
        };

        let devices: Vec<_> = snapshot.devices().into_iter().collect();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name.as_deref(), Some("Regular"));
        assert_eq!(devices[1].address, "BB:BB");
    }

    #[test]
    fn test_concurrent_advertisements() {
        use std::sync::Arc;

        let aggregator = Arc::new(ScanResultAggregator::new(DedupPolicy::ByAddress));
        aggregator.start();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let address = format!("{:02X}:{:02X}", t, i % 10);
                        aggregator.on_advertisement(adv(&address, -(i as i16)), ScanCallbackType::AllMatches);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(aggregator.stop().regular.len(), 40);
    }

    #[test]
    fn test_scan_settings_builder() {
        let settings = ScanSettings::new()
            .mode(ScanMode::LowLatency)
            .with_service(blecentral_types::uuid::BATTERY_SERVICE);

        assert_eq!(settings.mode, ScanMode::LowLatency);
        assert_eq!(settings.service_filter.len(), 1);
        assert_eq!(ScanSettings::default().mode, ScanMode::LowPower);
        assert!(ScanSettings::default().service_filter.is_empty());
    }

    #[test]
    fn test_device_list_replace_and_extend() {
        let mut list = DeviceList::new();
        list.replace(vec![
            DeviceRecord::new("AA:AA", None),
            DeviceRecord::new("BB:BB", None),
            DeviceRecord::new("AA:AA", Some("dup".to_string())),
        ]);
        assert_eq!(list.len(), 2);

        let added = list.extend(&[adv("BB:BB", -50), adv("CC:CC", -50), adv("CC:CC", -40)]);
        assert_eq!(added, 1);
        assert_eq!(list.len(), 3);
        assert!(list.contains("CC:CC"));

        list.replace(vec![DeviceRecord::new("DD:DD", None)]);
        assert_eq!(list.len(), 1);
        assert!(list.get("AA:AA").is_none());

        list.clear();
        assert!(list.is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn arb_result() -> impl Strategy<Value = ScanResult> {
        (0u8..8, prop::option::of(-100i16..0)).prop_map(|(addr, rssi)| ScanResult {
            address: format!("AA:{:02X}", addr),
            rssi,
            ..Default::default()
        })
    }

    fn arb_policy() -> impl Strategy<Value = DedupPolicy> {
        prop_oneof![Just(DedupPolicy::ByAddress), Just(DedupPolicy::ByValue)]
    }

    proptest! {
        /// Regular results never hold two equal entries under either policy.
        #[test]
        fn regular_results_are_unique(
            policy in arb_policy(),
            results in prop::collection::vec(arb_result(), 0..64),
        ) {
            let aggregator = ScanResultAggregator::new(policy);
            aggregator.start();
            for result in results {
                aggregator.on_advertisement(result, ScanCallbackType::AllMatches);
            }
            let regular = aggregator.stop().regular;
            let unique: HashSet<_> = regular.iter().collect();
            prop_assert_eq!(unique.len(), regular.len());

            if policy == DedupPolicy::ByAddress {
                let addresses: HashSet<_> = regular.iter().map(|r| &r.address).collect();
                prop_assert_eq!(addresses.len(), regular.len());
            }
        }

        /// Batch length always equals the number of results inserted.
        #[test]
        fn batch_length_matches_inserts(
            batches in prop::collection::vec(prop::collection::vec(arb_result(), 0..8), 0..8),
        ) {
            let aggregator = ScanResultAggregator::new(DedupPolicy::ByAddress);
            aggregator.start();
            let expected: usize = batches.iter().map(Vec::len).sum();
            for batch in batches {
                aggregator.on_batch(batch);
            }
            prop_assert_eq!(aggregator.stop().batch.len(), expected);
        }
    }
}
