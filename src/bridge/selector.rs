//! Bridge fleet registry and selection policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::observer::{BridgeEventObserver, ObserverList};
use crate::types::{BridgeAddress, RelayId};

use super::model::{Bridge, Health};

/// Out-of-band health probe for a single bridge, run between presence
/// updates. The probe mechanism itself (synthetic colibri allocation, ping,
/// whatever) is an external collaborator; the selector only consumes the
/// resulting `Health`.
#[async_trait]
pub trait BridgeHealthProbe: Send + Sync {
    async fn probe(&self, bridge: &BridgeAddress) -> Health;
}

/// Maintains the fleet of known bridges and selects one for a new
/// participant. All mutators and `select()` itself run under a single lock
/// (the bridge fleet has exactly one mutator type: this selector).
pub struct BridgeSelector {
    bridges: Mutex<HashMap<BridgeAddress, Bridge>>,
    overload_threshold: f64,
    correction_k: f64,
    correction_window: Duration,
    bridge_observers: ObserverList<dyn BridgeEventObserver>,
}

impl BridgeSelector {
    pub fn new(overload_threshold: f64, correction_k: f64, correction_window: Duration) -> Self {
        Self {
            bridges: Mutex::new(HashMap::new()),
            overload_threshold,
            correction_k,
            correction_window,
            bridge_observers: ObserverList::new(),
        }
    }

    pub fn add_bridge_observer(&self, observer: Arc<dyn BridgeEventObserver>) {
        self.bridge_observers.add(observer);
    }

    /// Upsert a bridge from a presence update; marks it operational.
    pub fn update_from_presence(
        &self,
        address: BridgeAddress,
        stress: f64,
        region: String,
        relay_id: RelayId,
        version: String,
        is_draining: bool,
        in_graceful_shutdown: bool,
    ) {
        let mut bridges = self.bridges.lock();
        let entry = bridges.entry(address.clone()).or_insert_with(|| {
            Bridge::new(
                address.clone(),
                relay_id.clone(),
                region.clone(),
                version.clone(),
                self.correction_k,
                self.correction_window,
            )
        });
        entry.update_from_presence(stress, region, relay_id, version, is_draining, in_graceful_shutdown);
        debug!(bridge = %address, stress, "bridge presence updated");
    }

    /// Drop a bridge (used on offline presence).
    pub fn remove(&self, address: &BridgeAddress) {
        if self.bridges.lock().remove(address).is_some() {
            info!(bridge = %address, "bridge removed from fleet");
            for obs in self.bridge_observers.snapshot() {
                obs.bridge_removed(address);
            }
        }
    }

    pub fn mark_non_operational(&self, address: &BridgeAddress) {
        if let Some(b) = self.bridges.lock().get_mut(address) {
            b.set_is_operational(false);
            warn!(bridge = %address, "bridge marked non-operational");
            for obs in self.bridge_observers.snapshot() {
                obs.bridge_non_operational(address);
            }
        }
    }

    pub fn mark_operational_after_success(&self, address: &BridgeAddress) {
        if let Some(b) = self.bridges.lock().get_mut(address) {
            b.mark_operational_after_success();
        }
    }

    pub fn note_endpoints_assigned(&self, address: &BridgeAddress, n: usize) {
        if let Some(b) = self.bridges.lock().get_mut(address) {
            b.note_endpoints_assigned(n);
        }
    }

    pub fn endpoints_moved(&self, address: &BridgeAddress, n: u64) {
        if let Some(b) = self.bridges.lock().get_mut(address) {
            b.endpoints_moved(n);
        }
    }

    pub fn corrected_stress(&self, address: &BridgeAddress) -> Option<f64> {
        self.bridges.lock().get_mut(address).map(|b| b.corrected_stress())
    }

    pub fn region_of(&self, address: &BridgeAddress) -> Option<String> {
        self.bridges.lock().get(address).map(|b| b.region.clone())
    }

    pub fn version_of(&self, address: &BridgeAddress) -> Option<String> {
        self.bridges.lock().get(address).map(|b| b.version.clone())
    }

    /// Any operational, non-draining bridge with `correctedStress` below the
    /// overload threshold.
    pub fn has_non_overloaded_bridge(&self) -> bool {
        let mut bridges = self.bridges.lock();
        bridges.values_mut().any(|b| {
            b.is_operational() && !b.is_draining() && b.corrected_stress() < self.overload_threshold
        })
    }

    /// Select a bridge for a new participant.
    ///
    /// `in_use` maps bridges already carrying this conference to their
    /// endpoint count on that bridge (from `BridgeSessionManager::session_counts`).
    /// Selection order:
    ///  1. filter out non-operational, draining and wrong-version bridges
    ///  2. prefer a bridge already in `in_use` with `correctedStress` below
    ///     the overload threshold
    ///  3. prefer same-region bridges
    ///  4. least-loaded by `correctedStress`, ties broken by address
    pub fn select(
        &self,
        in_use: &HashMap<BridgeAddress, usize>,
        participant_region: Option<&str>,
        pinned_version: Option<&str>,
    ) -> Option<BridgeAddress> {
        let mut bridges = self.bridges.lock();

        let mut candidates: Vec<(BridgeAddress, f64, String)> = bridges
            .iter_mut()
            .filter(|(_, b)| b.is_operational() && !b.is_draining() && b.health() != Health::Failing)
            .filter(|(_, b)| match pinned_version {
                Some(v) => b.version == v,
                None => true,
            })
            .map(|(addr, b)| (addr.clone(), b.corrected_stress(), b.region.clone()))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        // (2) same-conference, non-overloaded candidates win outright.
        if let Some((addr, _, _)) = candidates
            .iter()
            .filter(|(addr, stress, _)| in_use.contains_key(addr) && *stress < self.overload_threshold)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)))
        {
            return Some(addr.clone());
        }

        // (3) prefer same-region among remaining candidates, if any exist.
        if let Some(region) = participant_region {
            let same_region: Vec<_> =
                candidates.iter().filter(|(_, _, r)| r == region).cloned().collect();
            if !same_region.is_empty() {
                candidates = same_region;
            }
        }

        // (4) least-loaded by corrected stress, ties by address.
        candidates
            .into_iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)))
            .map(|(addr, _, _)| addr)
    }

    /// `BridgeAddress -> correctedStress` snapshot, for monitoring/redistribution.
    pub fn stress_snapshot(&self) -> HashMap<BridgeAddress, f64> {
        let mut bridges = self.bridges.lock();
        bridges.iter_mut().map(|(a, b)| (a.clone(), b.corrected_stress())).collect()
    }

    pub fn is_operational(&self, address: &BridgeAddress) -> bool {
        self.bridges.lock().get(address).map(|b| b.is_operational()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.bridges.lock().len()
    }

    /// Probe every known bridge once and record the result. A no-op unless
    /// `bridge.healthChecksEnabled` is set; callers gate the call on that.
    pub async fn run_health_pass(&self, probe: &dyn BridgeHealthProbe) {
        let addresses: Vec<BridgeAddress> = self.bridges.lock().keys().cloned().collect();
        for address in addresses {
            let health = probe.probe(&address).await;
            if let Some(b) = self.bridges.lock().get_mut(&address) {
                b.set_health(health);
            }
            if health == Health::Failing {
                warn!(bridge = %address, "health probe reports failing");
            }
        }
    }

    /// Spawn `run_health_pass` on a fixed interval. Dropping the returned
    /// handle's owner does not stop it; callers should `abort()` on shutdown.
    pub fn spawn_periodic_health_checks(
        self: &Arc<Self>,
        probe: Arc<dyn BridgeHealthProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.run_health_pass(probe.as_ref()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> BridgeSelector {
        BridgeSelector::new(0.8, 0.1, Duration::from_secs(10))
    }

    fn upsert(sel: &BridgeSelector, addr: &str, region: &str, stress: f64, version: &str) {
        sel.update_from_presence(
            BridgeAddress::new(addr),
            stress,
            region.into(),
            RelayId(format!("{addr}-relay")),
            version.into(),
            false,
            false,
        );
    }

    #[test]
    fn prefers_same_region_when_no_same_conference_candidate() {
        let sel = selector();
        upsert(&sel, "b1", "eu", 0.1, "1.0");
        upsert(&sel, "b2", "us", 0.1, "1.0");
        let in_use = HashMap::new();
        let chosen = sel.select(&in_use, Some("us"), None);
        assert_eq!(chosen, Some(BridgeAddress::new("b2")));
    }

    #[test]
    fn prefers_same_conference_bridge_even_cross_region_if_not_overloaded() {
        let sel = selector();
        upsert(&sel, "b1", "eu", 0.2, "1.0");
        upsert(&sel, "b2", "us", 0.1, "1.0");
        let mut in_use = HashMap::new();
        in_use.insert(BridgeAddress::new("b1"), 3);
        let chosen = sel.select(&in_use, Some("us"), None);
        assert_eq!(chosen, Some(BridgeAddress::new("b1")));
    }

    #[test]
    fn pinned_version_filters_candidates() {
        let sel = selector();
        upsert(&sel, "b1", "eu", 0.1, "1.0");
        upsert(&sel, "b2", "eu", 0.1, "2.0");
        let in_use = HashMap::new();
        let chosen = sel.select(&in_use, None, Some("2.0"));
        assert_eq!(chosen, Some(BridgeAddress::new("b2")));
    }

    #[test]
    fn returns_none_when_all_overloaded_and_no_same_conference_candidate() {
        let sel = selector();
        upsert(&sel, "b1", "eu", 0.95, "1.0");
        upsert(&sel, "b2", "eu", 0.9, "1.0");
        let in_use = HashMap::new();
        assert_eq!(sel.select(&in_use, None, None), None);
        assert!(!sel.has_non_overloaded_bridge());
    }

    #[test]
    fn least_loaded_wins_with_deterministic_tiebreak() {
        let sel = selector();
        upsert(&sel, "b2", "eu", 0.3, "1.0");
        upsert(&sel, "b1", "eu", 0.3, "1.0");
        let in_use = HashMap::new();
        // equal stress -> tie broken by address, "b1" < "b2"
        assert_eq!(sel.select(&in_use, None, None), Some(BridgeAddress::new("b1")));
    }

    struct FixedProbe(Health);

    #[async_trait]
    impl BridgeHealthProbe for FixedProbe {
        async fn probe(&self, _bridge: &BridgeAddress) -> Health {
            self.0
        }
    }

    #[tokio::test]
    async fn failing_health_excludes_bridge_from_selection() {
        let sel = selector();
        upsert(&sel, "b1", "eu", 0.1, "1.0");
        sel.run_health_pass(&FixedProbe(Health::Failing)).await;
        let in_use = HashMap::new();
        assert_eq!(sel.select(&in_use, None, None), None);
    }

    #[test]
    fn selector_monotonicity_assignment_never_decreases_own_corrected_stress() {
        let sel = selector();
        upsert(&sel, "b1", "eu", 0.1, "1.0");
        let in_use = HashMap::new();
        let before = sel.corrected_stress(&BridgeAddress::new("b1")).unwrap();
        sel.note_endpoints_assigned(&BridgeAddress::new("b1"), 1);
        let after = sel.corrected_stress(&BridgeAddress::new("b1")).unwrap();
        assert!(after >= before);
        let _ = sel.select(&in_use, None, None);
    }
}
