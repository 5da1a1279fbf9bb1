//! Runtime configuration, layout only.
//!
//! Every field here has an effect documented on the component that reads it;
//! this module only owns shape, defaults and validation. Loading from a
//! particular file format is left to the embedding application — everything
//! derives `serde::Deserialize` so JSON/YAML/TOML all work unchanged.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the focus process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JicofoConfig {
    pub conference: ConferenceConfig,
    pub bridge: BridgeConfig,
    pub recording: RecordingConfig,
    pub auth: AuthConfig,
}

impl Default for JicofoConfig {
    fn default() -> Self {
        Self {
            conference: ConferenceConfig::default(),
            bridge: BridgeConfig::default(),
            recording: RecordingConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl JicofoConfig {
    /// Validate cross-field and range constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.conference.max_ssrcs_per_user == 0 {
            return Err("conference.max_ssrcs_per_user must be greater than 0".to_string());
        }
        if self.conference.restart_request_rate_limit.max_requests == 0 {
            return Err(
                "conference.restart_request_rate_limits.max-requests must be greater than 0"
                    .to_string(),
            );
        }
        if self.conference.restart_request_rate_limit.min_interval
            > self.conference.restart_request_rate_limit.interval
        {
            return Err(
                "conference.restart_request_rate_limits.min-interval cannot exceed interval"
                    .to_string(),
            );
        }
        if self.bridge.load_redistribution.enabled && self.bridge.load_redistribution.endpoints == 0
        {
            return Err(
                "bridge.load-redistribution.endpoints must be greater than 0 when enabled"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.bridge.overload_threshold) {
            return Err("bridge.overload_threshold must be in [0, 1]".to_string());
        }
        if self.recording.multi_track_recorder_url_template.is_some() {
            let tmpl = self.recording.multi_track_recorder_url_template.as_ref().unwrap();
            if !tmpl.contains("MEETING_ID") {
                return Err(
                    "recording.multi-track-recorder-url-template must contain the MEETING_ID token"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}

/// Options consulted by `ConferenceOrchestrator`, `ConferenceStore` and
/// `Participant`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceConfig {
    /// Idle-expiry for rooms that never got a first participant.
    pub initial_timeout: Duration,
    /// Grace period before tearing down a lone-participant room.
    pub single_participant_timeout: Duration,
    /// Auto-grant moderation rights to the first participant to join.
    pub enable_auto_owner: bool,
    /// Require moderator rights to mute/force-mute other participants.
    pub enable_moderator_checks: bool,
    /// Per-user cap on the number of distinct ssrcs.
    pub max_ssrcs_per_user: usize,
    /// Per-user cap on concurrent audio senders.
    pub max_audio_senders: usize,
    /// Per-user cap on concurrent video senders.
    pub max_video_senders: usize,
    /// Use bridge-side ssrc rewriting instead of relaying client ssrcs as-is.
    pub use_ssrc_rewriting: bool,
    /// Advertise sources to clients using the JSON-encoded dialect.
    pub use_json_encoded_sources: bool,
    /// Strip simulcast ssrc-groups from offers before forwarding.
    pub strip_simulcast: bool,
    /// `conferenceSize -> delayMs` step function; looked up by floor entry.
    pub source_signaling_delays: BTreeMap<usize, u64>,
    /// Rate limit for participant restart requests.
    pub restart_request_rate_limit: RestartRateLimitConfig,
    /// How a participant is moved to a new bridge session.
    pub reinvite_method: ReinviteMethod,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        let mut delays = BTreeMap::new();
        delays.insert(0, 0);
        delays.insert(10, 150);
        delays.insert(50, 500);
        delays.insert(100, 1000);
        Self {
            initial_timeout: Duration::from_secs(15),
            single_participant_timeout: Duration::from_secs(20),
            enable_auto_owner: true,
            enable_moderator_checks: true,
            max_ssrcs_per_user: 20,
            max_audio_senders: 1,
            max_video_senders: 1,
            use_ssrc_rewriting: false,
            use_json_encoded_sources: false,
            strip_simulcast: false,
            source_signaling_delays: delays,
            restart_request_rate_limit: RestartRateLimitConfig::default(),
            reinvite_method: ReinviteMethod::TransportReplace,
        }
    }
}

impl ConferenceConfig {
    /// Floor lookup: the delay in effect for a conference of the given size.
    pub fn source_signaling_delay_ms(&self, conference_size: usize) -> u64 {
        self.source_signaling_delays
            .range(..=conference_size)
            .next_back()
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartRateLimitConfig {
    /// Minimum interval between any two restart requests from one participant.
    pub min_interval: Duration,
    /// Sliding window over which `max_requests` is counted.
    pub interval: Duration,
    /// Maximum restart requests allowed per `interval`.
    pub max_requests: u32,
}

impl Default for RestartRateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            interval: Duration::from_secs(60),
            max_requests: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReinviteMethod {
    TransportReplace,
    TerminateAndReinitiate,
}

/// Options consulted by `Bridge`, `BridgeSelector` and `LoadRedistributor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub health_checks_enabled: bool,
    pub brewery_jid: String,
    pub xmpp_connection_name: String,
    pub load_redistribution: LoadRedistributionConfig,
    /// `correctedStress >= overload_threshold` is overloaded.
    pub overload_threshold: f64,
    /// Per-recently-assigned-endpoint penalty added to `correctedStress`.
    pub stress_correction_k: f64,
    /// Window over which the recently-assigned-endpoint penalty decays to 0.
    pub stress_correction_window: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            health_checks_enabled: true,
            brewery_jid: "JvbBrewery@internal.example.com".to_string(),
            xmpp_connection_name: "default".to_string(),
            load_redistribution: LoadRedistributionConfig::default(),
            overload_threshold: 0.8,
            stress_correction_k: 0.1,
            stress_correction_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRedistributionConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub endpoints: usize,
    pub stress_threshold: f64,
}

impl Default for LoadRedistributionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
            endpoints: 1,
            stress_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Template containing the literal token `MEETING_ID`.
    pub multi_track_recorder_url_template: Option<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { multi_track_recorder_url_template: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_type: AuthType,
    pub login_url: Option<String>,
    pub enable_auto_login: bool,
    pub authentication_lifetime: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: AuthType::None,
            login_url: None,
            enable_auto_login: false,
            authentication_lifetime: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    None,
    Xmpp,
    Jwt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(JicofoConfig::default().validate().is_ok());
    }

    #[test]
    fn floor_lookup_picks_largest_key_not_exceeding_size() {
        let cfg = ConferenceConfig::default();
        assert_eq!(cfg.source_signaling_delay_ms(0), 0);
        assert_eq!(cfg.source_signaling_delay_ms(5), 0);
        assert_eq!(cfg.source_signaling_delay_ms(10), 150);
        assert_eq!(cfg.source_signaling_delay_ms(49), 150);
        assert_eq!(cfg.source_signaling_delay_ms(50), 500);
        assert_eq!(cfg.source_signaling_delay_ms(1000), 1000);
    }

    #[test]
    fn rejects_zero_ssrc_cap() {
        let mut cfg = JicofoConfig::default();
        cfg.conference.max_ssrcs_per_user = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_recorder_template_without_token() {
        let mut cfg = JicofoConfig::default();
        cfg.recording.multi_track_recorder_url_template = Some("https://rec.example/x".to_string());
        assert!(cfg.validate().is_err());
    }
}
