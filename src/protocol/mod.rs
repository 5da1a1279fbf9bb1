//! Signaling dialect treated as an opaque IQ-style request/response bus.
//! Wire shapes and stanza correlation live here; the actual transport
//! (XMPP connection, websocket, whatever the deployment uses) is an
//! external collaborator implementing [`SessionTransport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::conference::types::{Source, SourceSet};
use crate::error::CoreError;
use crate::session::types::{ColibriAllocation, Transport};
use crate::types::{BridgeAddress, EndpointId};

/// Error condition codes carried by a bridge or client error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    BadRequest,
    ItemNotFound,
    Conflict,
    ServiceUnavailable,
    Other(String),
}

/// Bridges attach an application-specific `reason` element to distinguish
/// "the conference isn't there" from "the bridge itself is unreachable".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeReason {
    ConferenceNotFound,
    GracefulShutdown,
    Other(String),
}

/// A bridge (colibri-dialect) error response.
#[derive(Debug, Clone)]
pub struct BridgeError {
    pub condition: ErrorCondition,
    pub reason: Option<BridgeReason>,
}

/// Classify a bridge error response into the crate's error taxonomy. The
/// presence of a `reason` element is what lets `item-not-found` mean either
/// "conference gone" or "bridge gone" — plain condition codes alone are
/// ambiguous.
pub fn classify_bridge_error(bridge: &BridgeAddress, err: &BridgeError) -> CoreError {
    match (&err.condition, &err.reason) {
        (ErrorCondition::ItemNotFound, Some(BridgeReason::ConferenceNotFound)) => {
            CoreError::conference_not_found(bridge.to_string(), "unknown".to_string())
        }
        (ErrorCondition::ServiceUnavailable, Some(BridgeReason::GracefulShutdown)) => {
            CoreError::bridge_in_graceful_shutdown(bridge.to_string())
        }
        (ErrorCondition::BadRequest, _) => {
            CoreError::bad_colibri_request(bridge.to_string(), "malformed conference-modify".to_string())
        }
        (other, _) => CoreError::generic_colibri_allocation_failed(bridge.to_string(), format!("{other:?}")),
    }
}

/// A response to a `ConferenceModify` can be a timeout (`None` ever
/// received), a typed error, or success — `None` alone must never be
/// conflated with an error.
pub enum ConferenceModifyOutcome {
    Accepted(ColibriAllocation),
    Rejected(BridgeError),
}

/// Request body sent to a bridge for endpoint/relay/media changes.
#[derive(Debug, Clone)]
pub struct ConferenceModifyRequest {
    pub conference_id: Option<String>,
    pub create: bool,
    pub expire: bool,
    pub endpoint: Option<EndpointModify>,
    pub relays: Vec<RelayModify>,
}

#[derive(Debug, Clone)]
pub struct EndpointModify {
    pub id: EndpointId,
    pub stats_id: String,
    pub transport: Option<Transport>,
    /// The endpoint's current source set, rewritten per
    /// `conference.use-ssrc-rewriting` if enabled. `None` means "leave
    /// sources unchanged" — distinct from `Some(empty)`.
    pub sources: Option<SourceSet>,
    pub force_mute_audio: bool,
    pub force_mute_video: bool,
    pub expire: bool,
}

#[derive(Debug, Clone)]
pub struct RelayModify {
    pub remote_relay_id: String,
    pub initiator: bool,
    pub add_endpoints: Vec<EndpointId>,
    pub remove_endpoints: Vec<EndpointId>,
    pub expire: bool,
    /// Set only on the relay's first wiring: the DTLS setup/websocket
    /// rewrite the bridge must apply. `None` once already rewritten once.
    pub transport: Option<Transport>,
}

/// Client-facing (Jingle-like) requests. The signaling transport acks or
/// errors each; a `null` result is a timeout, never silently a success.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    SessionInitiate { transport: Transport },
    SessionAccept,
    TransportInfo { transport: Transport },
    TransportAccept,
    TransportReject,
    SourceAdd { sources: Vec<Source>, json_encoded: bool },
    SourceRemove { sources: Vec<Source>, json_encoded: bool },
    SessionTerminate,
    MuteRequest { media_audio: bool, media_video: bool, do_mute: bool },
}

/// External collaborator: the actual wire transport. All suspension points
/// (allocation, mute, expiry) go through here and must be invoked outside
/// any held conference/session lock.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn conference_modify(
        &self,
        bridge: &BridgeAddress,
        request: ConferenceModifyRequest,
    ) -> Result<ConferenceModifyOutcome, CoreError>;

    async fn client_request(
        &self,
        endpoint: &EndpointId,
        request: ClientRequest,
    ) -> Result<(), CoreError>;
}

/// Generic "submit send, park on a single-slot future with timeout, resume"
/// correlator for stanza-id-keyed request/response traffic. A concrete
/// `SessionTransport` is free to use this internally, or its own scheme.
pub struct StanzaCorrelator<T> {
    pending: Mutex<HashMap<String, oneshot::Sender<T>>>,
    default_timeout: Duration,
}

impl<T> StanzaCorrelator<T> {
    pub fn new(default_timeout: Duration) -> Self {
        Self { pending: Mutex::new(HashMap::new()), default_timeout }
    }

    /// Register a waiter for `stanza_id` and await it with `deadline`
    /// (falling back to the configured default). Returns `None` on timeout.
    pub async fn await_response(self: &Arc<Self>, stanza_id: String, deadline: Option<Duration>) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(stanza_id.clone(), tx);
        let wait = timeout(deadline.unwrap_or(self.default_timeout), rx).await;
        self.pending.lock().remove(&stanza_id);
        match wait {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Resolve a pending waiter, called from the transport's receive path.
    pub fn resolve(&self, stanza_id: &str, value: T) -> bool {
        if let Some(tx) = self.pending.lock().remove(stanza_id) {
            tx.send(value).is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_item_not_found_with_reason_as_conference_not_found() {
        let bridge = BridgeAddress::new("jvb1");
        let err = BridgeError {
            condition: ErrorCondition::ItemNotFound,
            reason: Some(BridgeReason::ConferenceNotFound),
        };
        assert!(matches!(
            classify_bridge_error(&bridge, &err),
            CoreError::ConferenceNotFound { .. }
        ));
    }

    #[test]
    fn classifies_service_unavailable_with_shutdown_reason() {
        let bridge = BridgeAddress::new("jvb1");
        let err = BridgeError {
            condition: ErrorCondition::ServiceUnavailable,
            reason: Some(BridgeReason::GracefulShutdown),
        };
        assert!(matches!(
            classify_bridge_error(&bridge, &err),
            CoreError::BridgeInGracefulShutdown { .. }
        ));
    }

    #[test]
    fn bad_request_never_marks_bridge_faulty() {
        let bridge = BridgeAddress::new("jvb1");
        let err = BridgeError { condition: ErrorCondition::BadRequest, reason: None };
        let classified = classify_bridge_error(&bridge, &err);
        assert!(!classified.marks_bridge_faulty());
    }

    #[tokio::test]
    async fn correlator_resolves_pending_waiter() {
        let correlator = Arc::new(StanzaCorrelator::<u32>::new(Duration::from_secs(1)));
        let c2 = correlator.clone();
        let handle = tokio::spawn(async move { c2.await_response("s1".to_string(), None).await });
        tokio::task::yield_now().await;
        assert!(correlator.resolve("s1", 42));
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn correlator_times_out_without_resolve() {
        let correlator = Arc::new(StanzaCorrelator::<u32>::new(Duration::from_millis(20)));
        let result = correlator.await_response("s2".to_string(), None).await;
        assert_eq!(result, None);
    }
}
