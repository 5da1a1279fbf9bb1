//! Conference focus for a WebRTC multi-party conferencing system.
//!
//! Sits between conference clients, a pool of media relay servers
//! ("bridges"), and a signaling bus used for control traffic. Clients never
//! talk to bridges directly: they offer/answer media sessions to the focus,
//! which allocates channels on a selected bridge, cross-wires bridges via
//! inter-bridge relays when a conference spans more than one, and keeps
//! state synchronized as participants join, leave, mute or renegotiate.
//!
//! The crate is organized around three collaborating components:
//!
//! - [`conference`]: the per-room state machine — participant admission,
//!   signaling, source propagation, moderation.
//! - [`session`]: the colibri-level contract with one or more bridges for a
//!   single conference — endpoint allocation, relay mesh, expiry.
//! - [`bridge`]: the fleet of known bridges, selection policy, and
//!   proactive load redistribution.
//!
//! [`registry`] tracks optional integrations (SIP gateways, transcribers)
//! discovered the same way bridges are: brewery presence. [`protocol`]
//! treats the signaling dialect as an opaque request/response bus.
//! [`observer`] gives lifecycle/fleet events a capability-interface seam
//! instead of a global registry.

pub mod bridge;
pub mod conference;
pub mod config;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod types;

pub use config::JicofoConfig;
pub use error::{CoreError, Result};

/// Commonly used types, for `use jicofo_core::prelude::*;`.
pub mod prelude {
    pub use crate::bridge::{Bridge, BridgeHealthProbe, BridgeSelector, EndpointMover, Health, LoadRedistributor};
    pub use crate::conference::{ConferenceOrchestrator, ConferenceState, ConferenceStore, Participant, PinnedConference, Role};
    pub use crate::config::JicofoConfig;
    pub use crate::error::{CoreError, Result};
    pub use crate::observer::{BridgeEventObserver, ConferenceLifecycleObserver};
    pub use crate::protocol::SessionTransport;
    pub use crate::registry::MeetRegistry;
    pub use crate::runtime::JicofoRuntime;
    pub use crate::session::{BridgeSessionManager, Offer};
    pub use crate::types::{BridgeAddress, EndpointId, MediaType, RelayId, RoomId, StatsId};
}
