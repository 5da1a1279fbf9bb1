//! Crate-wide error taxonomy.
//!
//! One variant per failure mode in the design's error taxonomy (see
//! `DESIGN.md`), plus a handful of ambient conditions (`NotFound`,
//! `Internal`, `Config`, `Timeout`) that don't belong to the conference/
//! bridge domain but show up at the edges of it.

use thiserror::Error;

/// Errors produced by the conference/bridge control plane.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// No candidate bridge could be selected for a participant.
    #[error("no bridge available for conference {room}")]
    BridgeSelectionFailed { room: String },

    /// The bridge refused a new conference because it is shutting down.
    #[error("bridge {bridge} is in graceful shutdown")]
    BridgeInGracefulShutdown { bridge: String },

    /// The bridge reports it no longer knows about this conference.
    #[error("bridge {bridge} has no record of conference {room}")]
    ConferenceNotFound { bridge: String, room: String },

    /// Our own request was structurally invalid for the bridge.
    #[error("bad colibri request to {bridge}: {reason}")]
    BadColibriRequest { bridge: String, reason: String },

    /// No response arrived from the bridge within the configured deadline.
    #[error("colibri request to {bridge} timed out")]
    ColibriTimeout { bridge: String },

    /// The bridge's response could not be parsed.
    #[error("colibri response from {bridge} could not be parsed: {reason}")]
    ColibriParsing { bridge: String, reason: String },

    /// An error stanza came back with a condition we don't recognize.
    #[error("colibri allocation on {bridge} failed: {condition}")]
    GenericColibriAllocationFailed { bridge: String, condition: String },

    /// The client rejected (or timed out on) a session-initiate.
    #[error("client {endpoint} rejected invite: {reason}")]
    ClientInviteRejected { endpoint: String, reason: String },

    /// Too many restart requests from one participant in too short a window.
    #[error("restart request rate limit exceeded for {endpoint}, retry after {retry_after_ms}ms")]
    RestartRateLimitExceeded { endpoint: String, retry_after_ms: u64 },

    /// A source/role/id validation failed; the operation had no side effects.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A configuration value was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation exceeded its deadline outside the colibri request path
    /// (e.g. waiting on a conference-wide lock).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Anything that doesn't fit the taxonomy above; should be rare.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn bridge_selection_failed(room: impl Into<String>) -> Self {
        Self::BridgeSelectionFailed { room: room.into() }
    }

    pub fn bridge_in_graceful_shutdown(bridge: impl Into<String>) -> Self {
        Self::BridgeInGracefulShutdown { bridge: bridge.into() }
    }

    pub fn conference_not_found(bridge: impl Into<String>, room: impl Into<String>) -> Self {
        Self::ConferenceNotFound { bridge: bridge.into(), room: room.into() }
    }

    pub fn bad_colibri_request(bridge: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadColibriRequest { bridge: bridge.into(), reason: reason.into() }
    }

    pub fn colibri_timeout(bridge: impl Into<String>) -> Self {
        Self::ColibriTimeout { bridge: bridge.into() }
    }

    pub fn colibri_parsing(bridge: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ColibriParsing { bridge: bridge.into(), reason: reason.into() }
    }

    pub fn generic_colibri_allocation_failed(
        bridge: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self::GenericColibriAllocationFailed { bridge: bridge.into(), condition: condition.into() }
    }

    pub fn client_invite_rejected(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ClientInviteRejected { endpoint: endpoint.into(), reason: reason.into() }
    }

    pub fn restart_rate_limit_exceeded(endpoint: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::RestartRateLimitExceeded { endpoint: endpoint.into(), retry_after_ms }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::ValidationFailed(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error should mark the bridge it names as non-operational
    /// (per the bridge-error propagation policy — timeouts and parse failures are bridge
    /// faults, bad requests and rejected invites are not).
    pub fn marks_bridge_faulty(&self) -> bool {
        matches!(
            self,
            Self::ColibriTimeout { .. }
                | Self::ColibriParsing { .. }
                | Self::GenericColibriAllocationFailed { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
