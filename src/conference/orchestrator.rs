//! Per-conference state machine: admission, invite, source propagation,
//! moderation, restart handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{ConferenceConfig, ReinviteMethod};
use crate::conference::participant::{InviteState, Participant, Role};
use crate::conference::store::ConferenceStore;
use crate::conference::types::{Source, SourceMap, SourceSet};
use crate::error::{CoreError, Result};
use crate::observer::{ConferenceLifecycleObserver, ObserverList};
use crate::protocol::{ClientRequest, SessionTransport};
use crate::session::{BridgeSessionManager, Offer};
use crate::session::types::Transport;
use crate::types::{BridgeAddress, EndpointId, MediaType, RoomId, StatsId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConferenceState {
    Created,
    Started,
    Terminated,
}

struct Inner {
    state: ConferenceState,
    participants: HashMap<EndpointId, Participant>,
    source_map: SourceMap,
    has_had_participant: bool,
    registration_suspended: bool,
}

/// Owns one conference's lifecycle and all client-facing operations on top
/// of a `BridgeSessionManager`. State mutation is serialized by `inner`'s
/// lock; the colibri/client round trips happen outside it.
pub struct ConferenceOrchestrator {
    pub room: RoomId,
    config: ConferenceConfig,
    inner: Mutex<Inner>,
    sessions: Arc<BridgeSessionManager>,
    transport: Arc<dyn SessionTransport>,
    lifecycle_observers: ObserverList<dyn ConferenceLifecycleObserver>,
    min_participants: usize,
    single_participant_timer_generation: AtomicU64,
    created_at: Instant,
    /// Back-reference to the owning registry, consulted for version pins.
    /// `Weak` because the registry's entry holds the `Arc` the other way.
    store: Weak<ConferenceStore>,
}

impl ConferenceOrchestrator {
    pub fn new(
        room: RoomId,
        config: ConferenceConfig,
        sessions: Arc<BridgeSessionManager>,
        transport: Arc<dyn SessionTransport>,
        min_participants: usize,
        store: Weak<ConferenceStore>,
    ) -> Self {
        Self {
            room,
            config,
            inner: Mutex::new(Inner {
                state: ConferenceState::Created,
                participants: HashMap::new(),
                source_map: SourceMap::new(),
                has_had_participant: false,
                registration_suspended: false,
            }),
            sessions,
            transport,
            lifecycle_observers: ObserverList::new(),
            min_participants: min_participants.max(1),
            single_participant_timer_generation: AtomicU64::new(0),
            created_at: Instant::now(),
            store,
        }
    }

    pub fn add_lifecycle_observer(&self, observer: Arc<dyn ConferenceLifecycleObserver>) {
        self.lifecycle_observers.add(observer);
    }

    pub fn state(&self) -> ConferenceState {
        self.inner.lock().state
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    pub fn has_had_participant(&self) -> bool {
        self.inner.lock().has_had_participant
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Called once the initial MUC join succeeds.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == ConferenceState::Created {
            inner.state = ConferenceState::Started;
            drop(inner);
            for obs in self.lifecycle_observers.snapshot() {
                obs.conference_started(&self.room);
            }
        }
    }

    /// A real (non-focus, non-detector) remote occupant joined the MUC.
    /// Returns the participant ids now eligible for invitation, if the
    /// admission threshold is met.
    pub fn admit_participant(
        self: &Arc<Self>,
        id: EndpointId,
        stats_id: StatsId,
        region: Option<String>,
        role: Role,
    ) -> Vec<EndpointId> {
        let mut inner = self.inner.lock();
        let is_first = !inner.has_had_participant;
        inner.has_had_participant = true;
        let effective_role = if is_first && self.config.enable_auto_owner { Role::Owner } else { role };
        inner.participants.insert(
            id.clone(),
            Participant::new(id, stats_id, region, effective_role, self.config.restart_request_rate_limit.clone()),
        );

        if inner.participants.len() < self.min_participants {
            return Vec::new();
        }
        inner
            .participants
            .values()
            .filter(|p| p.invite_state == InviteState::Pending)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Invite one pending participant: allocate on a bridge, then send
    /// session-initiate (or, for a re-invite onto a new bridge, whatever
    /// `config.reinvite_method` calls for).
    pub async fn invite(self: &Arc<Self>, participant_id: EndpointId) -> Result<()> {
        let (stats_id, region, is_reinvite) = {
            let mut inner = self.inner.lock();
            let p = inner
                .participants
                .get_mut(&participant_id)
                .ok_or_else(|| CoreError::not_found(format!("participant {participant_id}")))?;
            let is_reinvite = p.bridge_session_id.is_some();
            p.invite_state = InviteState::Inviting;
            (p.stats_id.clone(), p.region.clone(), is_reinvite)
        };

        if is_reinvite && self.config.reinvite_method == ReinviteMethod::TerminateAndReinitiate {
            let _ = self.transport.client_request(&participant_id, ClientRequest::SessionTerminate).await;
        }

        let pinned_version = self.store.upgrade().and_then(|s| s.pinned_version(&self.room, Instant::now()));

        let offer = Offer { sources: SourceSet::new(), transport: Transport::empty_controlling() };
        let result = self
            .sessions
            .allocate(
                participant_id.clone(),
                stats_id,
                offer,
                false,
                false,
                region.as_deref(),
                pinned_version.as_deref(),
            )
            .await;

        match result {
            Ok(allocation) => {
                {
                    let mut inner = self.inner.lock();
                    if let Some(p) = inner.participants.get_mut(&participant_id) {
                        p.invite_state = InviteState::Invited;
                        p.bridge_session_id = Some(allocation.session_id.clone());
                    }
                }
                let request = if is_reinvite && self.config.reinvite_method == ReinviteMethod::TransportReplace {
                    ClientRequest::TransportInfo { transport: allocation.transport }
                } else {
                    ClientRequest::SessionInitiate { transport: allocation.transport }
                };
                self.transport.client_request(&participant_id, request).await
            }
            Err(e) => self.handle_invite_failure(participant_id, e).await,
        }
    }

    /// Classify an invite failure: bridge-fault and graceful-shutdown
    /// conditions are transient, so the participant goes back to `Pending`
    /// and is retried immediately; anything else is abandoned as `Failed`.
    async fn handle_invite_failure(self: &Arc<Self>, participant_id: EndpointId, e: CoreError) -> Result<()> {
        let should_retry = e.marks_bridge_faulty() || matches!(e, CoreError::BridgeInGracefulShutdown { .. });
        {
            let mut inner = self.inner.lock();
            if let Some(p) = inner.participants.get_mut(&participant_id) {
                p.invite_state = if should_retry { InviteState::Pending } else { InviteState::Failed };
            }
        }
        warn!(participant = %participant_id, error = %e, retrying = should_retry, "invite failed");
        if should_retry {
            let this = self.clone();
            let retry_id = participant_id.clone();
            tokio::spawn(async move {
                if let Err(e) = this.invite(retry_id.clone()).await {
                    warn!(participant = %retry_id, error = %e, "invite retry failed");
                }
            });
        }
        Err(e)
    }

    /// Merge ICE/fingerprint updates and push to the bridge.
    pub async fn on_transport_info(&self, participant_id: &EndpointId, transport: Transport) -> Result<()> {
        self.sessions.update_participant(participant_id, Some(transport), None, false).await
    }

    /// Client confirmed the initial session-initiate for the current bridge
    /// session; a session-accept for a stale (pre-reinvite) session id is
    /// silently ignored.
    pub fn on_session_accept(&self, participant_id: &EndpointId, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let p = inner
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| CoreError::not_found(format!("participant {participant_id}")))?;
        if p.is_current_session(session_id) {
            p.invite_state = InviteState::Accepted;
        }
        Ok(())
    }

    /// Client confirmed a transport-replace re-invite; same bookkeeping as a
    /// fresh session-accept.
    pub fn on_transport_accept(&self, participant_id: &EndpointId, session_id: &str) -> Result<()> {
        self.on_session_accept(participant_id, session_id)
    }

    /// Client rejected a session-initiate or transport-replace outright.
    /// Unlike a bridge fault, a client rejection is never retried.
    pub fn on_transport_reject(&self, participant_id: &EndpointId, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(p) = inner.participants.get_mut(participant_id) {
            p.invite_state = InviteState::Failed;
        }
        Err(CoreError::client_invite_rejected(participant_id.to_string(), reason.into()))
    }

    /// Endpoint ids of this conference's participants currently on `bridge`,
    /// for on-demand load redistribution.
    pub fn participants_on_bridge(&self, bridge: &BridgeAddress) -> Vec<EndpointId> {
        self.sessions.participants_on(bridge)
    }

    /// Validate and apply a source-add, then fan out the delta to every
    /// other participant after the configured batching delay.
    pub async fn on_source_add(
        self: &Arc<Self>,
        participant_id: &EndpointId,
        sources: Vec<Source>,
    ) -> Result<()> {
        let sources = if self.config.strip_simulcast { strip_simulcast_sources(sources) } else { sources };

        for s in &sources {
            if self.sessions.is_force_muted(participant_id, s.media_type) {
                return Err(CoreError::validation(format!(
                    "{} is force-muted for {}",
                    participant_id, s.media_type
                )));
            }
        }

        let (added, conference_size) = {
            let mut inner = self.inner.lock();
            if !inner.participants.contains_key(participant_id) {
                return Err(CoreError::not_found(format!("participant {participant_id}")));
            }

            for s in &sources {
                if inner.source_map.ssrc_collides(s.ssrc, participant_id) {
                    return Err(CoreError::validation(format!("ssrc {} already in use", s.ssrc)));
                }
            }

            let set = inner.source_map.entry(participant_id.clone());
            let existing_audio = set.count_of_media_type(MediaType::Audio);
            let existing_video = set.count_of_media_type(MediaType::Video);
            let new_audio = sources.iter().filter(|s| s.media_type == MediaType::Audio).count();
            let new_video = sources.iter().filter(|s| s.media_type == MediaType::Video).count();
            if existing_audio + new_audio > self.config.max_audio_senders
                || existing_video + new_video > self.config.max_video_senders
            {
                return Err(CoreError::validation("per-user sender cap exceeded"));
            }
            if set.len() + sources.len() > self.config.max_ssrcs_per_user {
                return Err(CoreError::validation("per-user ssrc cap exceeded"));
            }

            for s in sources.clone() {
                set.insert(s);
            }
            (sources, inner.source_map.conference_size())
        };

        let mut new_set = SourceSet::new();
        for s in &added {
            new_set.insert(s.clone());
        }
        self.sessions.update_participant(participant_id, None, Some(new_set), false).await?;

        let delay_ms = self.config.source_signaling_delay_ms(conference_size);
        self.schedule_propagation(participant_id.clone(), added, true, delay_ms);
        Ok(())
    }

    /// Validate and apply a source-remove; removes propagate immediately
    /// (never batched), so a remove can never arrive after a delayed add
    /// for the same source ends up racing it.
    pub async fn on_source_remove(&self, participant_id: &EndpointId, ssrcs: Vec<u32>) -> Result<()> {
        let removed: Vec<Source> = {
            let mut inner = self.inner.lock();
            let set = inner.source_map.entry(participant_id.clone());
            let mut removed = Vec::new();
            for ssrc in ssrcs {
                if let Some(s) = set.remove_ssrc(ssrc) {
                    removed.push(s);
                }
            }
            removed
        };
        if removed.is_empty() {
            return Ok(());
        }

        let mut set = SourceSet::new();
        for s in &removed {
            set.insert(s.clone());
        }
        self.sessions.update_participant(participant_id, None, Some(set), false).await?;
        self.propagate_now(participant_id, &removed, false).await;
        Ok(())
    }

    fn schedule_propagation(self: &Arc<Self>, owner: EndpointId, sources: Vec<Source>, is_add: bool, delay_ms: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            // Re-check each source is still owned by `owner`: if a remove
            // raced this batch, don't deliver a stale add.
            let still_present: Vec<Source> = {
                let inner = this.inner.lock();
                match inner.source_map.get(&owner) {
                    Some(set) => sources.into_iter().filter(|s| set.contains_ssrc(s.ssrc)).collect(),
                    None => Vec::new(),
                }
            };
            if !still_present.is_empty() {
                this.propagate_now(&owner, &still_present, is_add).await;
            }
        });
    }

    async fn propagate_now(&self, owner: &EndpointId, sources: &[Source], is_add: bool) {
        let others: Vec<EndpointId> = {
            let inner = self.inner.lock();
            inner.source_map.others(owner).map(|(id, _)| id.clone()).collect()
        };
        let json_encoded = self.config.use_json_encoded_sources;
        let request = if is_add {
            ClientRequest::SourceAdd { sources: sources.to_vec(), json_encoded }
        } else {
            ClientRequest::SourceRemove { sources: sources.to_vec(), json_encoded }
        };
        for other in others {
            let _ = self.transport.client_request(&other, request.clone()).await;
        }
    }

    /// Force-mute/unmute. Only moderators may mute others; owners cannot be
    /// muted by non-owners; unmuting a force-muted participant likewise
    /// requires moderator rights.
    pub async fn force_mute(
        &self,
        actor: &EndpointId,
        targets: &[EndpointId],
        do_mute: bool,
        media_type: MediaType,
    ) -> Result<bool> {
        if self.config.enable_moderator_checks {
            let inner = self.inner.lock();
            let actor_role = inner
                .participants
                .get(actor)
                .map(|p| p.role)
                .ok_or_else(|| CoreError::not_found(format!("participant {actor}")))?;
            if !actor_role.has_moderator_rights() {
                return Err(CoreError::validation("moderator rights required to mute"));
            }
            for target in targets {
                if let Some(t) = inner.participants.get(target) {
                    if t.role == Role::Owner && actor_role != Role::Owner {
                        return Err(CoreError::validation("owners cannot be muted by non-owners"));
                    }
                }
            }
        }
        Ok(self.sessions.mute(targets, do_mute, media_type).await)
    }

    pub fn restart_request(&self, participant_id: &EndpointId, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        let p = inner
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| CoreError::not_found(format!("participant {participant_id}")))?;
        p.try_restart_request(now)
    }

    /// A participant left (client disconnect, session-terminate, or being
    /// dropped by the bridge). Tears down bridge state, fans out the
    /// removal, and starts/stops the single-participant timer.
    pub async fn remove_participant(self: &Arc<Self>, participant_id: &EndpointId) {
        let removed_sources = {
            let mut inner = self.inner.lock();
            if inner.participants.remove(participant_id).is_none() {
                return;
            }
            inner.source_map.remove(participant_id)
        };

        self.sessions.remove_participant(participant_id).await;

        if let Some(set) = removed_sources {
            let sources: Vec<Source> = set.iter().cloned().collect();
            if !sources.is_empty() {
                self.propagate_now(participant_id, &sources, false).await;
            }
        }

        let remaining = self.inner.lock().participants.len();
        if remaining == 1 {
            self.arm_single_participant_timer();
        } else if remaining == 0 {
            self.terminate().await;
        }
    }

    fn arm_single_participant_timer(self: &Arc<Self>) {
        let generation = self.single_participant_timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        let timeout = self.config.single_participant_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if this.single_participant_timer_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if this.inner.lock().participants.len() == 1 {
                this.terminate().await;
            }
        });
    }

    /// A bridge dropped out of the fleet; re-invite every participant it
    /// was carrying.
    pub async fn handle_bridge_removed(self: &Arc<Self>, bridge: &BridgeAddress) {
        let to_reinvite = self.sessions.remove_bridge(bridge).await;
        for id in to_reinvite {
            self.reinvite_participant(id).await;
        }
    }

    /// Move a participant onto a fresh bridge allocation, keeping its
    /// conference metadata (stats id, region, role). `bridge_session_id` is
    /// left in place until `invite()` overwrites it, so it can tell this is
    /// a re-invite rather than a first invite and follow `reinvite_method`.
    pub async fn reinvite_participant(self: &Arc<Self>, participant_id: EndpointId) {
        {
            let mut inner = self.inner.lock();
            match inner.participants.get_mut(&participant_id) {
                Some(p) => p.invite_state = InviteState::Pending,
                None => return,
            }
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.invite(participant_id.clone()).await {
                warn!(participant = %participant_id, error = %e, "re-invite failed");
            }
        });
    }

    /// Signaling transport disconnected/reconnected. While suspended, new
    /// invites are deferred.
    pub fn set_registration_suspended(&self, suspended: bool) {
        self.inner.lock().registration_suspended = suspended;
        if suspended {
            info!(room = %self.room, "registration suspended, deferring invites");
        } else {
            info!(room = %self.room, "registration resumed");
        }
    }

    pub fn registration_suspended(&self) -> bool {
        self.inner.lock().registration_suspended
    }

    pub async fn terminate(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConferenceState::Terminated {
                return;
            }
            inner.state = ConferenceState::Terminated;
        }
        self.sessions.expire().await;
        for obs in self.lifecycle_observers.snapshot() {
            obs.conference_ended(&self.room);
        }
    }
}

/// Keep only the first video source in `sources`; audio passes through
/// untouched. There is no ssrc-group model here, so "strip simulcast" is
/// read at the granularity this crate actually tracks: one video ssrc
/// per source-add, not one per simulcast layer.
fn strip_simulcast_sources(sources: Vec<Source>) -> Vec<Source> {
    let mut seen_video = false;
    sources
        .into_iter()
        .filter(|s| {
            if s.media_type == MediaType::Video {
                if seen_video {
                    return false;
                }
                seen_video = true;
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conference::types::Source;

    #[test]
    fn strip_simulcast_keeps_one_video_source() {
        let sources = vec![
            Source { ssrc: 1, media_type: MediaType::Video, name: "v0".into(), msid: "m".into(), video_type: None },
            Source { ssrc: 2, media_type: MediaType::Video, name: "v1".into(), msid: "m".into(), video_type: None },
            Source { ssrc: 3, media_type: MediaType::Audio, name: "a0".into(), msid: "m".into(), video_type: None },
        ];
        let stripped = strip_simulcast_sources(sources);
        assert_eq!(stripped.len(), 2);
        assert_eq!(stripped.iter().filter(|s| s.media_type == MediaType::Video).count(), 1);
        assert_eq!(stripped.iter().filter(|s| s.media_type == MediaType::Audio).count(), 1);
    }
}
