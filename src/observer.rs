//! Capability-interface observers for conference lifecycle and bridge
//! events. Passed explicitly into the components that fire them — no
//! global registry. Listener lists are snapshotted before iteration so a
//! listener can freely add/remove others without deadlocking or tearing
//! the callbacks it's currently receiving.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{BridgeAddress, RoomId};

/// Fired by `ConferenceStore`/`ConferenceOrchestrator` on room lifecycle
/// transitions.
pub trait ConferenceLifecycleObserver: Send + Sync {
    fn conference_created(&self, _room: &RoomId) {}
    fn conference_started(&self, _room: &RoomId) {}
    fn conference_ended(&self, _room: &RoomId) {}
}

/// Fired by `BridgeSelector`/`LoadRedistributor` on fleet-level events.
pub trait BridgeEventObserver: Send + Sync {
    fn bridge_selection_failed(&self, _room: &RoomId) {}
    fn bridge_non_operational(&self, _bridge: &BridgeAddress) {}
    fn bridge_removed(&self, _bridge: &BridgeAddress) {}
}

/// Thread-safe, snapshot-before-iterate holder for one observer capability.
pub struct ObserverList<T: ?Sized> {
    observers: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> ObserverList<T> {
    pub fn new() -> Self {
        Self { observers: RwLock::new(Vec::new()) }
    }

    pub fn add(&self, observer: Arc<T>) {
        self.observers.write().push(observer);
    }

    pub fn remove(&self, observer: &Arc<T>) {
        self.observers.write().retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Snapshot under the lock, then hand the snapshot to the caller for
    /// iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.observers.read().clone()
    }
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        count: AtomicUsize,
    }
    impl ConferenceLifecycleObserver for CountingObserver {
        fn conference_ended(&self, _room: &RoomId) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn snapshot_allows_listener_to_remove_itself_mid_iteration() {
        let list: ObserverList<dyn ConferenceLifecycleObserver> = ObserverList::new();
        let a = Arc::new(CountingObserver { count: AtomicUsize::new(0) });
        let as_trait: Arc<dyn ConferenceLifecycleObserver> = a.clone();
        list.add(as_trait.clone());

        let room = RoomId::new("room1");
        let snapshot = list.snapshot();
        list.remove(&as_trait);
        for obs in &snapshot {
            obs.conference_ended(&room);
        }
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
        assert!(list.snapshot().is_empty());
    }
}
