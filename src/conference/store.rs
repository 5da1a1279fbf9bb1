//! Process-wide room registry: creation, version pinning, idle expiry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::bridge::EndpointMover;
use crate::conference::orchestrator::ConferenceOrchestrator;
use crate::types::{BridgeAddress, EndpointId, RoomId};

/// Operator-created version pin, consulted at allocation time so new
/// allocations in the room prefer the pinned bridge version.
#[derive(Debug, Clone)]
pub struct PinnedConference {
    pub room: RoomId,
    pub bridge_version: String,
    expires_at: Instant,
}

impl PinnedConference {
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Entry {
    handle: Arc<ConferenceOrchestrator>,
    pin: Option<PinnedConference>,
}

/// Concurrent room -> handle map. Creation is single-writer per key: the
/// lock is held only long enough to insert a placeholder, `start()` runs
/// outside it so other lookups never block on one room's MUC join.
pub struct ConferenceStore {
    rooms: Mutex<HashMap<RoomId, Entry>>,
}

impl ConferenceStore {
    pub fn new() -> Self {
        Self { rooms: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, room: &RoomId) -> Option<Arc<ConferenceOrchestrator>> {
        self.rooms.lock().get(room).map(|e| e.handle.clone())
    }

    pub fn all(&self) -> Vec<Arc<ConferenceOrchestrator>> {
        self.rooms.lock().values().map(|e| e.handle.clone()).collect()
    }

    /// Idempotent-by-lock creation: of N concurrent callers for the same
    /// room, exactly one receives `created = true` and is responsible for
    /// calling `start()`. `make` is handed a `Weak` back-reference to this
    /// store rather than an `Arc`, so the orchestrator it builds can consult
    /// pins without keeping the store alive (the store's own `Entry` already
    /// holds the orchestrator's `Arc`, so the reverse direction must be weak).
    pub fn get_or_create(
        self: &Arc<Self>,
        room: RoomId,
        make: impl FnOnce(Weak<ConferenceStore>) -> Arc<ConferenceOrchestrator>,
    ) -> (Arc<ConferenceOrchestrator>, bool) {
        let mut rooms = self.rooms.lock();
        if let Some(entry) = rooms.get(&room) {
            return (entry.handle.clone(), false);
        }
        let handle = make(Arc::downgrade(self));
        rooms.insert(room, Entry { handle: handle.clone(), pin: None });
        (handle, true)
    }

    pub fn remove(&self, room: &RoomId) {
        self.rooms.lock().remove(room);
    }

    /// Record a version pin, consulted by the orchestrator at allocation
    /// time. `pin_snapshot` is what callers should use to read it back —
    /// taken under the lock so the caller never observes a half-written pin.
    pub fn pin(&self, room: RoomId, version: impl Into<String>, duration: Duration) {
        let mut rooms = self.rooms.lock();
        let pin = PinnedConference {
            room: room.clone(),
            bridge_version: version.into(),
            expires_at: Instant::now() + duration,
        };
        if let Some(entry) = rooms.get_mut(&room) {
            entry.pin = Some(pin);
        }
    }

    pub fn unpin(&self, room: &RoomId) {
        if let Some(entry) = self.rooms.lock().get_mut(room) {
            entry.pin = None;
        }
    }

    /// Snapshot of the pinned version for `room`, if a pin is recorded and
    /// still valid at `now`.
    pub fn pinned_version(&self, room: &RoomId, now: Instant) -> Option<String> {
        self.rooms
            .lock()
            .get(room)
            .and_then(|e| e.pin.as_ref())
            .filter(|p| p.is_valid(now))
            .map(|p| p.bridge_version.clone())
    }

    /// Terminate any room that never got a first participant and has aged
    /// past `initial_timeout`. Intended to run on a periodic schedule.
    pub async fn sweep_idle(&self, initial_timeout: Duration) {
        let expired: Vec<Arc<ConferenceOrchestrator>> = {
            let rooms = self.rooms.lock();
            rooms
                .values()
                .filter(|e| !e.handle.has_had_participant() && e.handle.age() > initial_timeout)
                .map(|e| e.handle.clone())
                .collect()
        };
        for handle in &expired {
            info!(room = %handle.room, "idle-expiring conference with no participants");
            handle.terminate().await;
        }
        if !expired.is_empty() {
            let mut rooms = self.rooms.lock();
            rooms.retain(|_, e| e.handle.state() != crate::conference::orchestrator::ConferenceState::Terminated);
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }
}

impl Default for ConferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The store is the only collaborator that can see every conference hosted
/// on a bridge, so it — not a single `ConferenceOrchestrator` — is the
/// natural `EndpointMover`: moving an endpoint means finding which room it's
/// in, then asking that room's orchestrator to re-invite it.
#[async_trait]
impl EndpointMover for ConferenceStore {
    async fn move_endpoint(
        &self,
        conference: &RoomId,
        endpoint: &EndpointId,
        _from_bridge: Option<&BridgeAddress>,
    ) -> usize {
        match self.get(conference) {
            Some(handle) => {
                handle.reinvite_participant(endpoint.clone()).await;
                1
            }
            None => 0,
        }
    }

    async fn move_endpoints(&self, bridge: &BridgeAddress, conference: Option<&RoomId>, n: usize) -> usize {
        let candidates: Vec<Arc<ConferenceOrchestrator>> = match conference {
            Some(room) => self.get(room).into_iter().collect(),
            None => self.all(),
        };
        let mut moved = 0;
        for handle in candidates {
            if moved >= n {
                break;
            }
            for id in handle.participants_on_bridge(bridge) {
                if moved >= n {
                    break;
                }
                handle.reinvite_participant(id).await;
                moved += 1;
            }
        }
        moved
    }

    async fn move_fraction(&self, bridge: &BridgeAddress, frac: f64) -> usize {
        let total = self.endpoint_count(bridge).await;
        let n = (total as f64 * frac).round() as usize;
        self.move_endpoints(bridge, None, n).await
    }

    async fn endpoint_count(&self, bridge: &BridgeAddress) -> usize {
        self.all().iter().map(|h| h.participants_on_bridge(bridge).len()).sum()
    }
}
