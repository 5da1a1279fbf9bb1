//! The colibri-level contract for one conference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bridge::BridgeSelector;
use crate::conference::types::SourceSet;
use crate::error::{CoreError, Result};
use crate::observer::{BridgeEventObserver, ObserverList};
use crate::protocol::{
    ConferenceModifyOutcome, ConferenceModifyRequest, EndpointModify, RelayModify, SessionTransport,
};
use crate::session::types::{ColibriAllocation, ColibriSession, ParticipantInfo, Relay, Transport};
use crate::types::{BridgeAddress, EndpointId, MediaType, RelayId, StatsId};

/// One endpoint's initial media offer, enough to build a `ConferenceModify`.
#[derive(Debug, Clone)]
pub struct Offer {
    pub sources: SourceSet,
    pub transport: Transport,
}

struct State {
    sessions: HashMap<BridgeAddress, ColibriSession>,
    participants: HashMap<EndpointId, ParticipantInfo>,
    next_creation_seq: u64,
    /// `(owner, client ssrc) -> bridge-local synthetic ssrc`, populated only
    /// when `use_ssrc_rewriting` is enabled.
    ssrc_rewrite: HashMap<(EndpointId, u32), u32>,
    next_rewritten_ssrc: u32,
}

/// Owns every `ColibriSession` and `ParticipantInfo` for one conference.
/// A single lock protects both maps; the wire round-trip for allocation,
/// mute and expiry happens with the lock released.
pub struct BridgeSessionManager {
    room: crate::types::RoomId,
    state: Mutex<State>,
    selector: Arc<BridgeSelector>,
    transport: Arc<dyn SessionTransport>,
    allocation_timeout: Duration,
    use_ssrc_rewriting: bool,
    bridge_observers: ObserverList<dyn BridgeEventObserver>,
}

impl BridgeSessionManager {
    pub fn new(
        room: crate::types::RoomId,
        selector: Arc<BridgeSelector>,
        transport: Arc<dyn SessionTransport>,
        allocation_timeout: Duration,
        use_ssrc_rewriting: bool,
    ) -> Self {
        Self {
            room,
            state: Mutex::new(State {
                sessions: HashMap::new(),
                participants: HashMap::new(),
                next_creation_seq: 0,
                ssrc_rewrite: HashMap::new(),
                next_rewritten_ssrc: 0,
            }),
            selector,
            transport,
            allocation_timeout,
            use_ssrc_rewriting,
            bridge_observers: ObserverList::new(),
        }
    }

    pub fn add_bridge_observer(&self, observer: Arc<dyn BridgeEventObserver>) {
        self.bridge_observers.add(observer);
    }

    /// Substitute bridge-local synthetic ssrcs for `sources`, allocating one
    /// per (owner, ssrc) the first time it's seen. A no-op clone when
    /// `use_ssrc_rewriting` is disabled.
    fn rewrite_sources(&self, state: &mut State, owner: &EndpointId, sources: &SourceSet) -> SourceSet {
        if !self.use_ssrc_rewriting {
            return sources.clone();
        }
        let mut out = SourceSet::new();
        for s in sources.iter() {
            let key = (owner.clone(), s.ssrc);
            let rewritten_ssrc = match state.ssrc_rewrite.get(&key) {
                Some(&ssrc) => ssrc,
                None => {
                    state.next_rewritten_ssrc += 1;
                    let ssrc = state.next_rewritten_ssrc;
                    state.ssrc_rewrite.insert(key, ssrc);
                    ssrc
                }
            };
            let mut rewritten = s.clone();
            rewritten.ssrc = rewritten_ssrc;
            out.insert(rewritten);
        }
        out
    }

    /// Endpoint ids currently on `bridge`, for proactive load redistribution.
    pub fn participants_on(&self, bridge: &BridgeAddress) -> Vec<EndpointId> {
        self.state
            .lock()
            .sessions
            .get(bridge)
            .map(|s| s.participants.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `bridge -> endpoint count`, fed to `BridgeSelector::select` as `in_use`.
    pub fn session_counts(&self) -> HashMap<BridgeAddress, usize> {
        self.state
            .lock()
            .sessions
            .values()
            .map(|s| (s.bridge.clone(), s.participants.len()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn has_session_on(&self, bridge: &BridgeAddress) -> bool {
        self.state.lock().sessions.contains_key(bridge)
    }

    /// Whether `participant_id` is currently force-muted for `media_type`.
    pub fn is_force_muted(&self, participant_id: &EndpointId, media_type: MediaType) -> bool {
        self.state
            .lock()
            .participants
            .get(participant_id)
            .map(|p| match media_type {
                MediaType::Audio => p.audio_force_muted,
                MediaType::Video => p.video_force_muted,
            })
            .unwrap_or(false)
    }

    pub fn relay_count(&self, bridge: &BridgeAddress) -> usize {
        self.state.lock().sessions.get(bridge).map(|s| s.relays.len()).unwrap_or(0)
    }

    /// `(initiator, websocket_active)` of the one relay on `bridge`, if any.
    /// For test/debug introspection of the relay mesh asymmetry.
    pub fn relay_flags(&self, bridge: &BridgeAddress) -> Option<(bool, bool)> {
        self.state
            .lock()
            .sessions
            .get(bridge)?
            .relays
            .values()
            .next()
            .map(|r| (r.initiator, r.websocket_active))
    }

    /// Step 1-4 of the allocation protocol: pick a bridge, get-or-create its
    /// session, wire up relays, and build the wire request — all under the
    /// lock. Returns the request plus bookkeeping needed after the response.
    fn prepare_allocation(
        &self,
        participant_id: &EndpointId,
        stats_id: &StatsId,
        offer: &Offer,
        force_mute_audio: bool,
        force_mute_video: bool,
        participant_region: Option<&str>,
        pinned_version: Option<&str>,
    ) -> Result<(BridgeAddress, ConferenceModifyRequest, Vec<(BridgeAddress, ConferenceModifyRequest)>)> {
        let mut state = self.state.lock();

        if state.participants.contains_key(participant_id) {
            return Err(CoreError::validation(format!(
                "participant {participant_id} already allocated"
            )));
        }

        let in_use = state
            .sessions
            .values()
            .map(|s| (s.bridge.clone(), s.participants.len()))
            .collect();
        let bridge = self
            .selector
            .select(&in_use, participant_region, pinned_version)
            .ok_or_else(|| CoreError::bridge_selection_failed(self.room.to_string()))?;

        let is_new_session = !state.sessions.contains_key(&bridge);
        if is_new_session {
            let seq = state.next_creation_seq;
            state.next_creation_seq += 1;
            let relay_id = RelayId(format!("{}-{}", bridge, seq));
            state.sessions.insert(bridge.clone(), ColibriSession::new(bridge.clone(), relay_id, seq));
        }

        // Relay fan-out: every *other* existing session gets wired to this
        // one, in both directions, with the later-created side initiating.
        let mut relay_requests = Vec::new();
        if is_new_session {
            let new_seq = state.sessions.get(&bridge).unwrap().creation_seq;
            let new_relay_id = state.sessions.get(&bridge).unwrap().relay_id.clone();
            let other_bridges: Vec<BridgeAddress> =
                state.sessions.keys().filter(|b| **b != bridge).cloned().collect();

            for other in other_bridges {
                let (other_seq, other_relay_id, other_participants) = {
                    let s = state.sessions.get(&other).unwrap();
                    (s.creation_seq, s.relay_id.clone(), s.participants.clone())
                };
                let new_is_initiator = new_seq > other_seq;

                {
                    let new_session = state.sessions.get_mut(&bridge).unwrap();
                    let mut relay = Relay::new(new_relay_id.clone(), other_relay_id.clone(), new_is_initiator);
                    relay.remote_endpoints = other_participants.clone();
                    new_session.relays.insert(other_relay_id.clone(), relay);
                }
                {
                    let other_session = state.sessions.get_mut(&other).unwrap();
                    let mut relay = Relay::new(other_relay_id.clone(), new_relay_id.clone(), !new_is_initiator);
                    let mut offered = Transport::empty_controlling();
                    let transport = if relay.apply_transport_update(&mut offered) {
                        Some(offered)
                    } else {
                        warn!(bridge = %other, "relay transport update aborted: non-actpass setup proposed");
                        None
                    };
                    other_session.relays.insert(new_relay_id.clone(), relay.clone());
                    relay_requests.push((
                        other.clone(),
                        ConferenceModifyRequest {
                            conference_id: Some(other.to_string()),
                            create: false,
                            expire: false,
                            endpoint: None,
                            relays: vec![RelayModify {
                                remote_relay_id: new_relay_id.to_string(),
                                initiator: relay.initiator,
                                add_endpoints: vec![],
                                remove_endpoints: vec![],
                                expire: false,
                                transport,
                            }],
                        },
                    ));
                }
            }
        } else {
            // An existing session in the conference: tell every *other*
            // session's relay to add this participant as a remote endpoint.
            let other_bridges: Vec<BridgeAddress> =
                state.sessions.keys().filter(|b| **b != bridge).cloned().collect();
            for other in other_bridges {
                let session = state.sessions.get(&other).unwrap();
                if let Some(our_relay_id) = state.sessions.get(&bridge).map(|s| s.relay_id.clone()) {
                    if let Some(remote_relay) = session.relays.get(&our_relay_id) {
                        relay_requests.push((
                            other.clone(),
                            ConferenceModifyRequest {
                                conference_id: Some(other.to_string()),
                                create: false,
                                expire: false,
                                endpoint: None,
                                relays: vec![RelayModify {
                                    remote_relay_id: our_relay_id.to_string(),
                                    initiator: remote_relay.initiator,
                                    add_endpoints: vec![participant_id.clone()],
                                    remove_endpoints: vec![],
                                    expire: false,
                                    transport: None,
                                }],
                            },
                        ));
                    }
                }
            }
        }

        let rewritten_sources = self.rewrite_sources(&mut state, participant_id, &offer.sources);
        let request = ConferenceModifyRequest {
            conference_id: Some(bridge.to_string()),
            create: is_new_session,
            expire: false,
            endpoint: Some(EndpointModify {
                id: participant_id.clone(),
                stats_id: stats_id.to_string(),
                transport: Some(offer.transport.clone()),
                sources: Some(rewritten_sources),
                force_mute_audio,
                force_mute_video,
                expire: false,
            }),
            relays: vec![],
        };

        Ok((bridge, request, relay_requests))
    }

    /// Full allocation protocol: prepare under the lock, send without it,
    /// reconcile under the lock again.
    pub async fn allocate(
        &self,
        participant_id: EndpointId,
        stats_id: StatsId,
        offer: Offer,
        force_mute_audio: bool,
        force_mute_video: bool,
        participant_region: Option<&str>,
        pinned_version: Option<&str>,
    ) -> Result<ColibriAllocation> {
        let (bridge, request, relay_requests) = match self.prepare_allocation(
            &participant_id,
            &stats_id,
            &offer,
            force_mute_audio,
            force_mute_video,
            participant_region,
            pinned_version,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                if matches!(e, CoreError::BridgeSelectionFailed { .. }) {
                    for obs in self.bridge_observers.snapshot() {
                        obs.bridge_selection_failed(&self.room);
                    }
                }
                return Err(e);
            }
        };

        for (relay_bridge, relay_request) in relay_requests {
            // Best-effort: a relay-side failure doesn't abort the endpoint's
            // own allocation; it's logged for the operator.
            if let Err(e) = self.transport.conference_modify(&relay_bridge, relay_request).await {
                warn!(bridge = %relay_bridge, error = %e, "relay update failed");
            }
        }

        let outcome = timeout_classified(&self.transport, &bridge, request, self.allocation_timeout).await;

        let mut state = self.state.lock();
        match outcome {
            Ok(ConferenceModifyOutcome::Accepted(allocation)) => {
                if let Some(session) = state.sessions.get_mut(&bridge) {
                    session.participants.insert(participant_id.clone());
                    session.created = true;
                }
                state.participants.insert(
                    participant_id.clone(),
                    ParticipantInfo {
                        id: participant_id.clone(),
                        stats_id,
                        sources: offer.sources,
                        bridge: bridge.clone(),
                        audio_force_muted: force_mute_audio,
                        video_force_muted: force_mute_video,
                    },
                );
                self.selector.note_endpoints_assigned(&bridge, 1);
                self.selector.mark_operational_after_success(&bridge);
                info!(bridge = %bridge, endpoint = %participant_id, "endpoint allocated");
                Ok(allocation)
            }
            Ok(ConferenceModifyOutcome::Rejected(err)) => {
                let classified = crate::protocol::classify_bridge_error(&bridge, &err);
                Self::cleanup_failed_session(&mut state, &bridge, is_session_empty_after_failed_create(&state, &bridge));
                if classified.marks_bridge_faulty() {
                    self.selector.mark_non_operational(&bridge);
                }
                warn!(bridge = %bridge, error = %classified, "allocation rejected");
                Err(classified)
            }
            Err(classified) => {
                Self::cleanup_failed_session(&mut state, &bridge, is_session_empty_after_failed_create(&state, &bridge));
                self.selector.mark_non_operational(&bridge);
                warn!(bridge = %bridge, error = %classified, "allocation failed");
                Err(classified)
            }
        }
    }

    fn cleanup_failed_session(state: &mut State, bridge: &BridgeAddress, drop_session: bool) {
        if drop_session {
            state.sessions.remove(bridge);
        }
    }

    /// Push transport and/or source updates for an already-allocated
    /// participant, then propagate new sources to every other session's
    /// relay endpoint.
    pub async fn update_participant(
        &self,
        participant_id: &EndpointId,
        transport: Option<Transport>,
        sources: Option<SourceSet>,
        suppress_local_bridge_update: bool,
    ) -> Result<()> {
        let (bridge, request, propagate) = {
            let mut state = self.state.lock();
            let bridge = state
                .participants
                .get(participant_id)
                .map(|p| p.bridge.clone())
                .ok_or_else(|| CoreError::not_found(format!("participant {participant_id}")))?;

            if let Some(ref new_sources) = sources {
                if let Some(p) = state.participants.get_mut(participant_id) {
                    p.sources = new_sources.clone();
                }
            }

            let rewritten_sources = sources.as_ref().map(|s| self.rewrite_sources(&mut state, participant_id, s));
            let request = ConferenceModifyRequest {
                conference_id: Some(bridge.to_string()),
                create: false,
                expire: false,
                endpoint: Some(EndpointModify {
                    id: participant_id.clone(),
                    stats_id: state.participants.get(participant_id).unwrap().stats_id.to_string(),
                    transport,
                    sources: rewritten_sources,
                    force_mute_audio: state.participants.get(participant_id).unwrap().audio_force_muted,
                    force_mute_video: state.participants.get(participant_id).unwrap().video_force_muted,
                    expire: false,
                }),
                relays: vec![],
            };

            let other_bridges: Vec<BridgeAddress> =
                state.sessions.keys().filter(|b| **b != bridge).cloned().collect();
            (bridge, request, other_bridges)
        };

        if !suppress_local_bridge_update {
            if let Err(e) = self.transport.conference_modify(&bridge, request).await {
                warn!(bridge = %bridge, error = %e, "update_participant failed");
                return Err(e);
            }
        }

        for other in propagate {
            let req = ConferenceModifyRequest {
                conference_id: Some(other.to_string()),
                create: false,
                expire: false,
                endpoint: None,
                relays: vec![],
            };
            let _ = self.transport.conference_modify(&other, req).await;
        }
        Ok(())
    }

    /// Force-mute/unmute a batch of participants for one media type.
    pub async fn mute(&self, participant_ids: &[EndpointId], do_mute: bool, media_type: MediaType) -> bool {
        let requests: Vec<(BridgeAddress, ConferenceModifyRequest)> = {
            let mut state = self.state.lock();
            let mut out = Vec::new();
            for id in participant_ids {
                if let Some(p) = state.participants.get_mut(id) {
                    match media_type {
                        MediaType::Audio => p.audio_force_muted = do_mute,
                        MediaType::Video => p.video_force_muted = do_mute,
                    }
                    out.push((
                        p.bridge.clone(),
                        ConferenceModifyRequest {
                            conference_id: Some(p.bridge.to_string()),
                            create: false,
                            expire: false,
                            endpoint: Some(EndpointModify {
                                id: id.clone(),
                                stats_id: p.stats_id.to_string(),
                                transport: None,
                                sources: None,
                                force_mute_audio: p.audio_force_muted,
                                force_mute_video: p.video_force_muted,
                                expire: false,
                            }),
                            relays: vec![],
                        },
                    ));
                }
            }
            out
        };

        let mut all_ok = true;
        for (bridge, request) in requests {
            if self.transport.conference_modify(&bridge, request).await.is_err() {
                all_ok = false;
            }
        }
        all_ok
    }

    /// Idempotent: a second call for an already-removed participant is a
    /// no-op, including no further bridge traffic.
    pub async fn remove_participant(&self, participant_id: &EndpointId) {
        let (bridge, expire_session, propagate) = {
            let mut state = self.state.lock();
            let Some(info) = state.participants.remove(participant_id) else {
                return;
            };
            let bridge = info.bridge;
            let mut expire_session = false;
            if let Some(session) = state.sessions.get_mut(&bridge) {
                session.participants.remove(participant_id);
                if session.is_empty() {
                    expire_session = true;
                }
            }
            let other_bridges: Vec<BridgeAddress> =
                state.sessions.keys().filter(|b| **b != bridge).cloned().collect();
            (bridge, expire_session, other_bridges)
        };

        let request = ConferenceModifyRequest {
            conference_id: Some(bridge.to_string()),
            create: false,
            expire: expire_session,
            endpoint: Some(EndpointModify {
                id: participant_id.clone(),
                stats_id: String::new(),
                transport: None,
                sources: None,
                force_mute_audio: false,
                force_mute_video: false,
                expire: true,
            }),
            relays: vec![],
        };
        let _ = self.transport.conference_modify(&bridge, request).await;

        if expire_session {
            self.expire_session(&bridge, propagate).await;
        } else {
            for other in propagate {
                let req = ConferenceModifyRequest {
                    conference_id: Some(other.to_string()),
                    create: false,
                    expire: false,
                    endpoint: None,
                    relays: vec![RelayModify {
                        remote_relay_id: bridge.to_string(),
                        initiator: false,
                        add_endpoints: vec![],
                        remove_endpoints: vec![participant_id.clone()],
                        expire: false,
                        transport: None,
                    }],
                };
                let _ = self.transport.conference_modify(&other, req).await;
            }
        }
    }

    async fn expire_session(&self, bridge: &BridgeAddress, others: Vec<BridgeAddress>) {
        {
            let mut state = self.state.lock();
            let relay_id = state.sessions.get(bridge).map(|s| s.relay_id.clone());
            state.sessions.remove(bridge);
            if let Some(rid) = relay_id {
                for other in &others {
                    if let Some(s) = state.sessions.get_mut(other) {
                        s.relays.remove(&rid);
                    }
                }
            }
        }
        for other in others {
            let req = ConferenceModifyRequest {
                conference_id: Some(other.to_string()),
                create: false,
                expire: false,
                endpoint: None,
                relays: vec![RelayModify {
                    remote_relay_id: bridge.to_string(),
                    initiator: false,
                    add_endpoints: vec![],
                    remove_endpoints: vec![],
                    expire: true,
                    transport: None,
                }],
            };
            let _ = self.transport.conference_modify(&other, req).await;
        }
    }

    /// A bridge went away (marked non-operational elsewhere); drop its
    /// session and relays, and return the endpoint ids the orchestrator
    /// must re-invite.
    pub async fn remove_bridge(&self, bridge: &BridgeAddress) -> Vec<EndpointId> {
        let (removed, others) = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.remove(bridge) else {
                return Vec::new();
            };
            for id in &session.participants {
                state.participants.remove(id);
            }
            let others: Vec<BridgeAddress> = state.sessions.keys().cloned().collect();
            for other in &others {
                if let Some(s) = state.sessions.get_mut(other) {
                    s.relays.remove(&session.relay_id);
                }
            }
            (session.participants.into_iter().collect::<Vec<_>>(), others)
        };

        for other in others {
            let req = ConferenceModifyRequest {
                conference_id: Some(other.to_string()),
                create: false,
                expire: false,
                endpoint: None,
                relays: vec![RelayModify {
                    remote_relay_id: bridge.to_string(),
                    initiator: false,
                    add_endpoints: vec![],
                    remove_endpoints: vec![],
                    expire: true,
                    transport: None,
                }],
            };
            let _ = self.transport.conference_modify(&other, req).await;
        }
        removed
    }

    /// Tear down every session in the conference, best-effort.
    pub async fn expire(&self) {
        let bridges: Vec<BridgeAddress> = self.state.lock().sessions.keys().cloned().collect();
        for bridge in bridges {
            let req = ConferenceModifyRequest {
                conference_id: Some(bridge.to_string()),
                create: false,
                expire: true,
                endpoint: None,
                relays: vec![],
            };
            let _ = self.transport.conference_modify(&bridge, req).await;
        }
        let mut state = self.state.lock();
        state.sessions.clear();
        state.participants.clear();
    }
}

fn is_session_empty_after_failed_create(state: &State, bridge: &BridgeAddress) -> bool {
    state.sessions.get(bridge).map(|s| s.is_empty()).unwrap_or(false)
}

async fn timeout_classified(
    transport: &Arc<dyn SessionTransport>,
    bridge: &BridgeAddress,
    request: ConferenceModifyRequest,
    deadline: Duration,
) -> std::result::Result<ConferenceModifyOutcome, CoreError> {
    match tokio::time::timeout(deadline, transport.conference_modify(bridge, request)).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CoreError::colibri_timeout(bridge.to_string())),
    }
}
