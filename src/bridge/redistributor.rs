//! Proactive endpoint migration off overloaded bridges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::LoadRedistributionConfig;
use crate::types::{BridgeAddress, EndpointId, RoomId};

use super::selector::BridgeSelector;

/// The redistributor never picks the destination bridge itself — it asks
/// this collaborator to re-invite the endpoint, which goes through normal
/// `BridgeSelector::select` and therefore never lands back on the bridge
/// being drained (the caller excludes it by construction: the source bridge
/// is, by definition, the overloaded one).
#[async_trait]
pub trait EndpointMover: Send + Sync {
    /// Move one endpoint off its current bridge (or `from_bridge` if given).
    async fn move_endpoint(
        &self,
        conference: &RoomId,
        endpoint: &EndpointId,
        from_bridge: Option<&BridgeAddress>,
    ) -> usize;

    /// Move up to `n` endpoints off `bridge`, optionally scoped to one
    /// conference. Greedy over conferences hosted on `bridge`, ordered by
    /// descending endpoint-count-on-this-bridge, taking as many as remain
    /// of the budget from each. Returns the number actually moved.
    async fn move_endpoints(&self, bridge: &BridgeAddress, conference: Option<&RoomId>, n: usize) -> usize;

    /// Move `frac` (0.0..=1.0) of `bridge`'s endpoints.
    async fn move_fraction(&self, bridge: &BridgeAddress, frac: f64) -> usize;

    /// Total endpoints currently on `bridge`, for fraction math.
    async fn endpoint_count(&self, bridge: &BridgeAddress) -> usize;
}

/// Runs the on-demand API plus the automatic periodic loop.
pub struct LoadRedistributor {
    selector: Arc<BridgeSelector>,
    mover: Arc<dyn EndpointMover>,
    config: LoadRedistributionConfig,
    /// Bridges currently in a post-move timeout, to avoid oscillation and a
    /// thundering-herd of re-selections.
    timeouts: DashMap<BridgeAddress, Instant>,
}

impl LoadRedistributor {
    pub fn new(selector: Arc<BridgeSelector>, mover: Arc<dyn EndpointMover>, config: LoadRedistributionConfig) -> Self {
        Self { selector, mover, config, timeouts: DashMap::new() }
    }

    fn in_timeout(&self, bridge: &BridgeAddress) -> bool {
        match self.timeouts.get(bridge) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    fn enter_timeout(&self, bridge: &BridgeAddress) {
        self.timeouts.insert(bridge.clone(), Instant::now() + self.config.timeout);
    }

    // -- on-demand API --------------------------------------------------

    pub async fn move_endpoint(&self, conference: &RoomId, endpoint: &EndpointId, from_bridge: Option<&BridgeAddress>) -> usize {
        self.mover.move_endpoint(conference, endpoint, from_bridge).await
    }

    pub async fn move_endpoints(&self, bridge: &BridgeAddress, conference: Option<&RoomId>, n: usize) -> usize {
        self.mover.move_endpoints(bridge, conference, n).await
    }

    pub async fn move_fraction(&self, bridge: &BridgeAddress, frac: f64) -> usize {
        self.mover.move_fraction(bridge, frac).await
    }

    // -- automatic loop ---------------------------------------------------

    /// Run one pass of the automatic redistribution loop. Exposed separately
    /// from `spawn_periodic` so tests can drive it deterministically.
    pub async fn run_once(&self) {
        if !self.config.enabled {
            return;
        }
        if !self.selector.has_non_overloaded_bridge() {
            debug!("redistribution loop skipped: no non-overloaded bridge to receive endpoints");
            return;
        }

        let stresses: HashMap<BridgeAddress, f64> = self.selector.stress_snapshot();
        for (bridge, stress) in stresses {
            if self.in_timeout(&bridge) {
                continue;
            }
            if stress >= self.config.stress_threshold {
                let moved = self.mover.move_endpoints(&bridge, None, self.config.endpoints).await;
                info!(bridge = %bridge, moved, stress, "redistributed endpoints off overloaded bridge");
                self.enter_timeout(&bridge);
            }
        }
    }

    /// Spawn the periodic task. The returned handle can be aborted on
    /// shutdown.
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingMover {
        calls: AtomicUsize,
        moved_per_call: usize,
    }

    #[async_trait]
    impl EndpointMover for CountingMover {
        async fn move_endpoint(&self, _c: &RoomId, _e: &EndpointId, _b: Option<&BridgeAddress>) -> usize {
            1
        }
        async fn move_endpoints(&self, _bridge: &BridgeAddress, _conference: Option<&RoomId>, n: usize) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            n.min(self.moved_per_call)
        }
        async fn move_fraction(&self, bridge: &BridgeAddress, frac: f64) -> usize {
            (self.endpoint_count(bridge).await as f64 * frac) as usize
        }
        async fn endpoint_count(&self, _bridge: &BridgeAddress) -> usize {
            10
        }
    }

    fn selector_with(addr: &str, stress: f64) -> Arc<BridgeSelector> {
        let sel = Arc::new(BridgeSelector::new(0.8, 0.1, Duration::from_secs(10)));
        sel.update_from_presence(
            BridgeAddress::new(addr),
            stress,
            "eu".into(),
            crate::types::RelayId(format!("{addr}-relay")),
            "1.0".into(),
            false,
            false,
        );
        sel
    }

    #[tokio::test]
    async fn moves_endpoints_and_enters_timeout_when_overloaded() {
        let sel = selector_with("b1", 0.9);
        // a second, non-overloaded bridge so has_non_overloaded_bridge() is true
        sel.update_from_presence(
            BridgeAddress::new("b2"),
            0.1,
            "eu".into(),
            crate::types::RelayId("b2-relay".into()),
            "1.0".into(),
            false,
            false,
        );
        let mover = Arc::new(CountingMover { calls: AtomicUsize::new(0), moved_per_call: 1 });
        let cfg = LoadRedistributionConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            endpoints: 1,
            stress_threshold: 0.8,
        };
        let redistributor = LoadRedistributor::new(sel, mover.clone(), cfg);
        redistributor.run_once().await;
        assert_eq!(mover.calls.load(Ordering::SeqCst), 1);
        assert!(redistributor.in_timeout(&BridgeAddress::new("b1")));

        // second pass within timeout should skip b1 even though still overloaded
        redistributor.run_once().await;
        assert_eq!(mover.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_when_no_non_overloaded_bridge_exists() {
        let sel = selector_with("b1", 0.95);
        let mover = Arc::new(CountingMover { calls: AtomicUsize::new(0), moved_per_call: 1 });
        let cfg = LoadRedistributionConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            endpoints: 1,
            stress_threshold: 0.8,
        };
        let redistributor = LoadRedistributor::new(sel, mover.clone(), cfg);
        redistributor.run_once().await;
        assert_eq!(mover.calls.load(Ordering::SeqCst), 0);
    }
}
