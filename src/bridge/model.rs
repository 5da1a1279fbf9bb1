//! Per-bridge health, stress and lifecycle state.

use std::time::{Duration, Instant};

use crate::types::{BridgeAddress, RelayId};

/// Health as reported by an optional out-of-band probe.
/// The probe mechanism itself is external; the selector only consumes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Healthy,
    Failing,
}

/// One entry in the short-horizon "recently assigned" correction ring:
/// an endpoint counted against `correctedStress` until it decays out.
#[derive(Debug, Clone, Copy)]
struct RecentAssignment {
    at: Instant,
}

/// Observed state of one bridge, as reported via presence plus mutations
/// made by the selector/session-manager when it allocates against it.
///
/// No locks are required for reads; all mutators run under the selector's
/// lock (enforced by `BridgeSelector`, not by this type itself).
#[derive(Debug, Clone)]
pub struct Bridge {
    pub address: BridgeAddress,
    pub relay_id: RelayId,
    pub region: String,
    pub version: String,
    is_operational: bool,
    is_draining: bool,
    in_graceful_shutdown: bool,
    stress: f64,
    pub last_reported: Instant,
    health: Health,
    recent_assignments: Vec<RecentAssignment>,
    endpoints_moved: u64,
    correction_k: f64,
    correction_window: Duration,
}

impl Bridge {
    pub fn new(
        address: BridgeAddress,
        relay_id: RelayId,
        region: String,
        version: String,
        correction_k: f64,
        correction_window: Duration,
    ) -> Self {
        Self {
            address,
            relay_id,
            region,
            version,
            is_operational: true,
            is_draining: false,
            in_graceful_shutdown: false,
            stress: 0.0,
            last_reported: Instant::now(),
            health: Health::Unknown,
            recent_assignments: Vec::new(),
            endpoints_moved: 0,
            correction_k,
            correction_window,
        }
    }

    /// Apply a presence update: refresh stress/region/relay-id/version and
    /// mark the bridge operational again.
    pub fn update_from_presence(
        &mut self,
        stress: f64,
        region: String,
        relay_id: RelayId,
        version: String,
        is_draining: bool,
        in_graceful_shutdown: bool,
    ) {
        self.stress = stress;
        self.region = region;
        self.relay_id = relay_id;
        self.version = version;
        self.is_draining = is_draining;
        self.in_graceful_shutdown = in_graceful_shutdown;
        self.is_operational = true;
        self.last_reported = Instant::now();
    }

    pub fn is_operational(&self) -> bool {
        self.is_operational
    }

    /// Disable selection. A bridge becomes operational again only after the
    /// next successful allocation against it (`mark_operational_after_success`),
    /// not merely by the passage of time.
    pub fn set_is_operational(&mut self, operational: bool) {
        self.is_operational = operational;
    }

    pub fn mark_operational_after_success(&mut self) {
        self.is_operational = true;
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining
    }

    pub fn is_in_graceful_shutdown(&self) -> bool {
        self.in_graceful_shutdown
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn set_health(&mut self, health: Health) {
        self.health = health;
    }

    /// Raw, presence-reported stress in [0, 1].
    pub fn stress(&self) -> f64 {
        self.stress
    }

    /// Record that `n` endpoints were just assigned to this bridge; they
    /// count against `corrected_stress` until the correction window elapses,
    /// even if presence hasn't caught up yet.
    pub fn note_endpoints_assigned(&mut self, n: usize) {
        let now = Instant::now();
        for _ in 0..n {
            self.recent_assignments.push(RecentAssignment { at: now });
        }
    }

    /// `stress + k * recently_added_endpoints`, with recently-added pruned by
    /// the correction window so fleet-wide k makes rapid assignments visible
    /// before the bridge's next presence report, then fades back out.
    pub fn corrected_stress(&mut self) -> f64 {
        let now = Instant::now();
        self.recent_assignments
            .retain(|a| now.duration_since(a.at) < self.correction_window);
        self.stress + self.correction_k * self.recent_assignments.len() as f64
    }

    /// Same as `corrected_stress` but does not prune (for read-only callers
    /// that can't take `&mut self`, e.g. across a shared snapshot).
    pub fn corrected_stress_view(&self) -> f64 {
        let now = Instant::now();
        let live = self
            .recent_assignments
            .iter()
            .filter(|a| now.duration_since(a.at) < self.correction_window)
            .count();
        self.stress + self.correction_k * live as f64
    }

    pub fn endpoints_moved(&mut self, n: u64) {
        self.endpoints_moved += n;
    }

    pub fn total_endpoints_moved(&self) -> u64 {
        self.endpoints_moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bridge() -> Bridge {
        Bridge::new(
            BridgeAddress::new("jvb1"),
            RelayId("r1".into()),
            "us-east".into(),
            "2.1".into(),
            0.1,
            Duration::from_millis(50),
        )
    }

    #[test]
    fn corrected_stress_adds_penalty_for_recent_assignments() {
        let mut b = bridge();
        b.update_from_presence(0.1, "us-east".into(), RelayId("r1".into()), "2.1".into(), false, false);
        assert!((b.corrected_stress() - 0.1).abs() < 1e-9);
        b.note_endpoints_assigned(2);
        assert!((b.corrected_stress() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn corrected_stress_decays_after_window() {
        let mut b = bridge();
        b.note_endpoints_assigned(1);
        assert!(b.corrected_stress() > b.stress());
        std::thread::sleep(Duration::from_millis(60));
        assert!((b.corrected_stress() - b.stress()).abs() < 1e-9);
    }

    #[test]
    fn non_operational_until_explicit_success() {
        let mut b = bridge();
        b.set_is_operational(false);
        assert!(!b.is_operational());
        b.mark_operational_after_success();
        assert!(b.is_operational());
    }
}
