//! End-to-end scenarios exercising the conference/session/bridge triangle
//! together, against a fake signaling transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use jicofo_core::bridge::{BridgeSelector, EndpointMover, LoadRedistributor};
use jicofo_core::conference::types::SourceSet;
use jicofo_core::conference::{ConferenceOrchestrator, ConferenceStore, Role};
use jicofo_core::config::JicofoConfig;
use jicofo_core::protocol::{ClientRequest, ConferenceModifyOutcome, ConferenceModifyRequest, SessionTransport};
use jicofo_core::session::types::{ColibriAllocation, Transport};
use jicofo_core::session::BridgeSessionManager;
use jicofo_core::types::{BridgeAddress, EndpointId, MediaType, RelayId, RoomId, StatsId};
use jicofo_core::CoreError;

struct FakeTransport {
    requests: Mutex<Vec<(BridgeAddress, ConferenceModifyRequest)>>,
    client_requests: Mutex<Vec<(EndpointId, String)>>,
    fail_bridges: Mutex<std::collections::HashSet<BridgeAddress>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            client_requests: Mutex::new(Vec::new()),
            fail_bridges: Mutex::new(std::collections::HashSet::new()),
        })
    }

    fn fail(&self, bridge: &BridgeAddress) {
        self.fail_bridges.lock().insert(bridge.clone());
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn conference_modify(
        &self,
        bridge: &BridgeAddress,
        request: ConferenceModifyRequest,
    ) -> jicofo_core::Result<ConferenceModifyOutcome> {
        self.requests.lock().push((bridge.clone(), request));
        if self.fail_bridges.lock().contains(bridge) {
            return Err(CoreError::colibri_timeout(bridge.to_string()));
        }
        Ok(ConferenceModifyOutcome::Accepted(ColibriAllocation {
            feedback_sources: SourceSet::new(),
            transport: Transport::empty_controlling(),
            region: "default".into(),
            session_id: bridge.to_string(),
            sctp_port: None,
        }))
    }

    async fn client_request(&self, endpoint: &EndpointId, request: ClientRequest) -> jicofo_core::Result<()> {
        let label = match request {
            ClientRequest::SessionInitiate { .. } => "session-initiate",
            ClientRequest::SourceAdd { .. } => "source-add",
            ClientRequest::SourceRemove { .. } => "source-remove",
            _ => "other",
        };
        self.client_requests.lock().push((endpoint.clone(), label.to_string()));
        Ok(())
    }
}

struct FakeMover {
    moved: Mutex<Vec<(BridgeAddress, usize)>>,
}

#[async_trait]
impl EndpointMover for FakeMover {
    async fn move_endpoint(&self, _c: &RoomId, _e: &EndpointId, _b: Option<&BridgeAddress>) -> usize {
        1
    }
    async fn move_endpoints(&self, bridge: &BridgeAddress, _conference: Option<&RoomId>, n: usize) -> usize {
        self.moved.lock().push((bridge.clone(), n));
        n
    }
    async fn move_fraction(&self, _bridge: &BridgeAddress, _frac: f64) -> usize {
        0
    }
    async fn endpoint_count(&self, _bridge: &BridgeAddress) -> usize {
        10
    }
}

fn upsert(selector: &BridgeSelector, addr: &str, region: &str, stress: f64, version: &str) {
    selector.update_from_presence(
        BridgeAddress::new(addr),
        stress,
        region.into(),
        RelayId(format!("{addr}-relay")),
        version.into(),
        false,
        false,
    );
}

fn harness(
    room: &str,
) -> (Arc<BridgeSelector>, Arc<FakeTransport>, Arc<BridgeSessionManager>, Arc<ConferenceStore>, Arc<ConferenceOrchestrator>) {
    let selector = Arc::new(BridgeSelector::new(0.8, 0.1, Duration::from_secs(10)));
    let transport = FakeTransport::new();
    let room_id = RoomId::new(room);
    let sessions = Arc::new(BridgeSessionManager::new(
        room_id.clone(),
        selector.clone(),
        transport.clone(),
        Duration::from_secs(5),
        false,
    ));
    let config = JicofoConfig::default();
    let store = Arc::new(ConferenceStore::new());
    let (orchestrator, _created) = store.get_or_create(room_id.clone(), |weak_store| {
        Arc::new(ConferenceOrchestrator::new(
            room_id.clone(),
            config.conference,
            sessions.clone(),
            transport.clone(),
            1,
            weak_store,
        ))
    });
    orchestrator.start();
    (selector, transport, sessions, store, orchestrator)
}

#[tokio::test]
async fn scenario_1_single_bridge_two_participants() {
    let (selector, _transport, sessions, _store, orchestrator) = harness("room1");
    upsert(&selector, "b1", "eu", 0.1, "1.0");

    let invite1 = orchestrator.admit_participant(EndpointId::new("p1"), StatsId::new("s1"), Some("eu".into()), Role::Member);
    for id in invite1 {
        orchestrator.invite(id).await.unwrap();
    }
    let invite2 = orchestrator.admit_participant(EndpointId::new("p2"), StatsId::new("s2"), Some("eu".into()), Role::Member);
    for id in invite2 {
        orchestrator.invite(id).await.unwrap();
    }

    assert_eq!(sessions.session_count(), 1);
    assert!(sessions.has_session_on(&BridgeAddress::new("b1")));
    assert_eq!(sessions.relay_count(&BridgeAddress::new("b1")), 0);
}

#[tokio::test]
async fn scenario_2_two_bridges_cross_region_relay_mesh() {
    let (selector, _transport, sessions, _store, orchestrator) = harness("room2");
    upsert(&selector, "b1", "r1", 0.1, "1.0");
    upsert(&selector, "b2", "r2", 0.1, "1.0");

    let invite1 = orchestrator.admit_participant(EndpointId::new("p1"), StatsId::new("s1"), Some("r1".into()), Role::Member);
    for id in invite1 {
        orchestrator.invite(id).await.unwrap();
    }
    let invite2 = orchestrator.admit_participant(EndpointId::new("p2"), StatsId::new("s2"), Some("r2".into()), Role::Member);
    for id in invite2 {
        orchestrator.invite(id).await.unwrap();
    }

    assert_eq!(sessions.session_count(), 2);
    assert_eq!(sessions.relay_count(&BridgeAddress::new("b1")), 1);
    assert_eq!(sessions.relay_count(&BridgeAddress::new("b2")), 1);

    let (init_b1, ws_b1) = sessions.relay_flags(&BridgeAddress::new("b1")).unwrap();
    let (init_b2, ws_b2) = sessions.relay_flags(&BridgeAddress::new("b2")).unwrap();
    assert_ne!(init_b1, init_b2, "exactly one side initiates");
    assert_eq!(ws_b1, init_b1, "only the initiator advertises a websocket");
    assert_eq!(ws_b2, init_b2);
}

#[tokio::test]
async fn scenario_3_bridge_failure_triggers_reinvite() {
    let (selector, _transport, sessions, _store, orchestrator) = harness("room3");
    upsert(&selector, "b1", "eu", 0.1, "1.0");
    upsert(&selector, "b2", "eu", 0.1, "1.0");

    let invite1 = orchestrator.admit_participant(EndpointId::new("p1"), StatsId::new("s1"), Some("eu".into()), Role::Member);
    for id in invite1 {
        orchestrator.invite(id).await.unwrap();
    }

    selector.mark_non_operational(&BridgeAddress::new("b1"));
    selector.remove(&BridgeAddress::new("b1"));

    let to_reinvite = sessions.remove_bridge(&BridgeAddress::new("b1")).await;
    assert_eq!(to_reinvite, vec![EndpointId::new("p1")]);

    for id in to_reinvite {
        orchestrator.invite(id).await.unwrap();
    }

    assert_eq!(sessions.session_count(), 1);
    assert!(sessions.has_session_on(&BridgeAddress::new("b2")));
    assert_eq!(sessions.relay_count(&BridgeAddress::new("b2")), 0);
}

#[tokio::test]
async fn scenario_4_load_redistribution_moves_endpoints_and_enters_timeout() {
    let selector = Arc::new(BridgeSelector::new(0.8, 0.1, Duration::from_secs(10)));
    upsert(&selector, "b1", "eu", 0.9, "1.0");
    upsert(&selector, "b2", "eu", 0.1, "1.0");

    let mover = Arc::new(FakeMover { moved: Mutex::new(Vec::new()) });
    let cfg = JicofoConfig::default().bridge.load_redistribution;
    let redistributor = LoadRedistributor::new(selector.clone(), mover.clone(), cfg);

    redistributor.run_once().await;

    let moved = mover.moved.lock();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].0, BridgeAddress::new("b1"));
}

#[tokio::test]
async fn scenario_5_pin_honored_then_expires() {
    let selector = Arc::new(BridgeSelector::new(0.8, 0.1, Duration::from_secs(10)));
    upsert(&selector, "b1", "eu", 0.1, "1.0");
    upsert(&selector, "b2", "eu", 0.1, "2.0");

    let transport = FakeTransport::new();
    let room = RoomId::new("room5");
    let sessions = Arc::new(BridgeSessionManager::new(
        room.clone(),
        selector.clone(),
        transport.clone(),
        Duration::from_secs(5),
        false,
    ));
    let store = Arc::new(ConferenceStore::new());
    let (orchestrator, _created) = store.get_or_create(room.clone(), |weak_store| {
        Arc::new(ConferenceOrchestrator::new(
            room.clone(),
            JicofoConfig::default().conference,
            sessions.clone(),
            transport.clone(),
            1,
            weak_store,
        ))
    });
    orchestrator.start();

    // Pinned to "2.0": the allocation this invite triggers must land on b2,
    // not on the otherwise-equal b1, proving the pin actually reaches
    // `BridgeSessionManager::allocate` through the orchestrator.
    store.pin(room.clone(), "2.0", Duration::from_millis(200));
    let invited = orchestrator.admit_participant(EndpointId::new("p1"), StatsId::new("s1"), Some("eu".into()), Role::Member);
    for id in invited {
        orchestrator.invite(id).await.unwrap();
    }
    assert!(sessions.has_session_on(&BridgeAddress::new("b2")));
    assert!(!sessions.has_session_on(&BridgeAddress::new("b1")));

    std::thread::sleep(Duration::from_millis(250));
    let pinned_after = store.pinned_version(&room, std::time::Instant::now());
    assert_eq!(pinned_after, None, "pin should have expired");

    // Once expired, a fresh selection (no sticky in-use bridge) is free to
    // pick on stress alone; b1 wins the deterministic tiebreak since both
    // bridges report identical stress.
    let in_use = std::collections::HashMap::new();
    let chosen = selector.select(&in_use, None, pinned_after.as_deref());
    assert_eq!(chosen, Some(BridgeAddress::new("b1")));
}

#[tokio::test]
async fn scenario_6_source_add_rejected_while_force_muted() {
    let (selector, _transport, sessions, _store, orchestrator) = harness("room6");
    upsert(&selector, "b1", "eu", 0.1, "1.0");

    let invite1 = orchestrator.admit_participant(EndpointId::new("p1"), StatsId::new("s1"), Some("eu".into()), Role::Member);
    for id in invite1 {
        orchestrator.invite(id).await.unwrap();
    }

    sessions.mute(&[EndpointId::new("p1")], true, MediaType::Audio).await;

    let source = jicofo_core::conference::types::Source {
        ssrc: 99,
        media_type: MediaType::Audio,
        name: "audio0".into(),
        msid: "m0".into(),
        video_type: None,
    };
    let result = orchestrator.on_source_add(&EndpointId::new("p1"), vec![source]).await;
    assert!(result.is_err());
}
