//! Crate-setup facade: wires the fleet selector, load redistributor and
//! room registry together and owns their background tasks.
//!
//! Building the three collaborators by hand (as the integration tests do,
//! for fine-grained control) is always an option; `JicofoRuntime` exists for
//! an embedding application that just wants "start the focus process" with
//! sane background-task wiring.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bridge::{BridgeHealthProbe, BridgeSelector, EndpointMover, LoadRedistributor};
use crate::config::JicofoConfig;
use crate::conference::ConferenceStore;
use crate::registry::MeetRegistry;

/// Owns the fleet-wide collaborators shared by every conference: the bridge
/// selector, the room registry, and the proactive load redistributor.
/// `ConferenceStore` doubles as the redistributor's `EndpointMover`, since it
/// is the only collaborator that can see every conference hosted on a bridge.
pub struct JicofoRuntime {
    pub config: JicofoConfig,
    pub selector: Arc<BridgeSelector>,
    pub store: Arc<ConferenceStore>,
    pub registry: Arc<MeetRegistry>,
    pub redistributor: Arc<LoadRedistributor>,
}

impl JicofoRuntime {
    pub fn new(config: JicofoConfig, local_region: impl Into<String>) -> Self {
        let selector = Arc::new(BridgeSelector::new(
            config.bridge.overload_threshold,
            config.bridge.stress_correction_k,
            config.bridge.stress_correction_window,
        ));
        let store = Arc::new(ConferenceStore::new());
        let mover: Arc<dyn EndpointMover> = store.clone();
        let redistributor =
            Arc::new(LoadRedistributor::new(selector.clone(), mover, config.bridge.load_redistribution.clone()));
        let registry = Arc::new(MeetRegistry::new(local_region));
        Self { config, selector, store, registry, redistributor }
    }

    /// Spawn every enabled background task: the redistribution loop, health
    /// checks (if a probe is supplied), and the idle-room sweep. Callers own
    /// the returned handles and should `abort()` them on shutdown.
    pub fn spawn_background_tasks(&self, health_probe: Option<Arc<dyn BridgeHealthProbe>>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.bridge.load_redistribution.enabled {
            handles.push(self.redistributor.clone().spawn_periodic());
        }

        if self.config.bridge.health_checks_enabled {
            if let Some(probe) = health_probe {
                handles.push(
                    self.selector
                        .spawn_periodic_health_checks(probe, self.config.bridge.load_redistribution.interval),
                );
            }
        }

        let store = self.store.clone();
        let initial_timeout = self.config.conference.initial_timeout;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval(initial_timeout));
            loop {
                ticker.tick().await;
                store.sweep_idle(initial_timeout).await;
            }
        }));

        handles
    }
}

/// Sweep on a cadence proportional to the idle timeout itself, never less
/// than a second: short configured timeouts (as in tests) still get a
/// reasonable poll cadence instead of a near-busy loop.
fn sweep_interval(initial_timeout: Duration) -> Duration {
    (initial_timeout / 4).max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_has_a_floor() {
        assert_eq!(sweep_interval(Duration::from_millis(100)), Duration::from_secs(1));
        assert_eq!(sweep_interval(Duration::from_secs(40)), Duration::from_secs(10));
    }

    #[test]
    fn runtime_wires_selector_store_and_redistributor() {
        let runtime = JicofoRuntime::new(JicofoConfig::default(), "eu");
        assert_eq!(runtime.store.len(), 0);
        assert_eq!(runtime.selector.len(), 0);
    }
}
