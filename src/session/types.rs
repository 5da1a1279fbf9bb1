//! Colibri-level data types: allocations, sessions, relays.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::conference::types::SourceSet;
use crate::types::{BridgeAddress, EndpointId, RelayId, StatsId};

/// DTLS setup role. Tied deterministically to `Relay::initiator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlsSetup {
    Active,
    Passive,
    ActPass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    /// (hash-function, fingerprint) pairs.
    pub fingerprints: Vec<(String, String)>,
    pub candidates: Vec<IceCandidate>,
    pub ice_controlling: bool,
    pub setup: DtlsSetup,
    /// Present only on the side of a relay permitted to advertise one.
    pub websocket: Option<String>,
}

impl Transport {
    pub fn empty_controlling() -> Self {
        Self {
            ufrag: None,
            pwd: None,
            fingerprints: Vec::new(),
            candidates: Vec::new(),
            ice_controlling: true,
            setup: DtlsSetup::ActPass,
            websocket: None,
        }
    }
}

/// What the bridge hands back after accepting an endpoint allocation.
/// Immutable once produced.
#[derive(Debug, Clone)]
pub struct ColibriAllocation {
    pub feedback_sources: SourceSet,
    pub transport: Transport,
    pub region: String,
    pub session_id: String,
    pub sctp_port: Option<u16>,
}

/// Per-participant bookkeeping held by `BridgeSessionManager`.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub id: EndpointId,
    pub stats_id: StatsId,
    pub sources: SourceSet,
    pub bridge: BridgeAddress,
    pub audio_force_muted: bool,
    pub video_force_muted: bool,
}

/// A bridge-to-bridge relay link, always created in a twinned pair: one per
/// side, never a cross-pointer between the two `ColibriSession`s.
#[derive(Debug, Clone)]
pub struct Relay {
    pub id: RelayId,
    pub remote_relay_id: RelayId,
    pub initiator: bool,
    pub dtls_role: DtlsSetup,
    pub controlling: bool,
    pub websocket_active: bool,
    pub transport_updated: bool,
    /// Endpoints of the *remote* session mirrored onto this relay.
    pub remote_endpoints: HashSet<EndpointId>,
}

impl Relay {
    /// Initiator: ICE controlling, DTLS active, unique-port, may advertise a
    /// websocket. Non-initiator: the mirror image.
    pub fn new(id: RelayId, remote_relay_id: RelayId, initiator: bool) -> Self {
        Self {
            id,
            remote_relay_id,
            initiator,
            dtls_role: if initiator { DtlsSetup::Active } else { DtlsSetup::Passive },
            controlling: initiator,
            websocket_active: initiator,
            transport_updated: false,
            remote_endpoints: HashSet::new(),
        }
    }

    /// Rewrite `offered`'s DTLS setup to this relay's fixed role and strip
    /// the websocket extension on the non-initiator side. A no-op (returns
    /// `true`, `offered` untouched) once already applied. Returns `false`
    /// if the bridge proposed a setup other than `actpass` — the caller
    /// must abort the update rather than send a contradictory setup.
    pub fn apply_transport_update(&mut self, offered: &mut Transport) -> bool {
        if self.transport_updated {
            return true;
        }
        if offered.setup != DtlsSetup::ActPass {
            return false;
        }
        offered.setup = self.dtls_role;
        if !self.initiator {
            offered.websocket = None;
        }
        self.transport_updated = true;
        true
    }
}

/// Per-bridge child of the bridge-session manager. Owns its relay fan-out
/// as `remoteRelayId -> Relay`, never a pointer back into the peer session.
#[derive(Debug, Clone)]
pub struct ColibriSession {
    pub bridge: BridgeAddress,
    pub relay_id: RelayId,
    pub participants: HashSet<EndpointId>,
    pub relays: HashMap<RelayId, Relay>,
    pub created: bool,
    /// Monotonic creation order across the conference's sessions; used to
    /// derive the initiator flag deterministically (later session initiates).
    pub creation_seq: u64,
}

impl ColibriSession {
    pub fn new(bridge: BridgeAddress, relay_id: RelayId, creation_seq: u64) -> Self {
        Self {
            bridge,
            relay_id,
            participants: HashSet::new(),
            relays: HashMap::new(),
            created: false,
            creation_seq,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
