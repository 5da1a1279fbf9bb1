//! One participant's conference-facing state: role, invite state, restart
//! rate limiting.

use std::time::{Duration, Instant};

use crate::config::RestartRateLimitConfig;
use crate::error::{CoreError, Result};
use crate::types::{EndpointId, StatsId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Moderator,
    Member,
}

impl Role {
    pub fn has_moderator_rights(&self) -> bool {
        matches!(self, Role::Owner | Role::Moderator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    Pending,
    Inviting,
    Invited,
    /// Client sent session-accept for the current bridge session.
    Accepted,
    Failed,
}

/// Token-bucket rate limiter for client restart requests: a minimum
/// interval between any two requests, plus a cap within a sliding window.
#[derive(Debug, Clone)]
pub struct RestartRateLimiter {
    config: RestartRateLimitConfig,
    history: Vec<Instant>,
    last_request: Option<Instant>,
}

impl RestartRateLimiter {
    pub fn new(config: RestartRateLimitConfig) -> Self {
        Self { config, history: Vec::new(), last_request: None }
    }

    /// Record an attempt at `now`; `Ok(())` if allowed, `Err` with the
    /// retryable-after duration if rejected.
    pub fn try_acquire(&mut self, now: Instant) -> Result<()> {
        if let Some(last) = self.last_request {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_interval {
                let retry_after = self.config.min_interval - elapsed;
                return Err(CoreError::restart_rate_limit_exceeded(
                    "participant",
                    retry_after.as_millis() as u64,
                ));
            }
        }
        self.history.retain(|t| now.saturating_duration_since(*t) < self.config.interval);
        if self.history.len() as u32 >= self.config.max_requests {
            let oldest = *self.history.first().unwrap();
            let retry_after = self.config.interval - now.saturating_duration_since(oldest);
            return Err(CoreError::restart_rate_limit_exceeded(
                "participant",
                retry_after.as_millis() as u64,
            ));
        }
        self.history.push(now);
        self.last_request = Some(now);
        Ok(())
    }
}

/// Per-participant conference state. The endpoint id survives a bridge
/// re-invite; only `bridge_session_id` changes, so stale client
/// transport-info referring to a superseded session can be detected.
pub struct Participant {
    pub id: EndpointId,
    pub stats_id: StatsId,
    pub region: Option<String>,
    pub role: Role,
    pub invite_state: InviteState,
    pub bridge_session_id: Option<String>,
    restart_limiter: RestartRateLimiter,
}

impl Participant {
    pub fn new(
        id: EndpointId,
        stats_id: StatsId,
        region: Option<String>,
        role: Role,
        rate_limit_config: RestartRateLimitConfig,
    ) -> Self {
        Self {
            id,
            stats_id,
            region,
            role,
            invite_state: InviteState::Pending,
            bridge_session_id: None,
            restart_limiter: RestartRateLimiter::new(rate_limit_config),
        }
    }

    pub fn try_restart_request(&mut self, now: Instant) -> Result<()> {
        self.restart_limiter.try_acquire(now)
    }

    /// Whether `candidate_session_id` matches the current live session;
    /// stale transport-info from before a re-invite is silently dropped.
    pub fn is_current_session(&self, candidate_session_id: &str) -> bool {
        self.bridge_session_id.as_deref() == Some(candidate_session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartRateLimitConfig;

    fn limiter() -> RestartRateLimiter {
        RestartRateLimiter::new(RestartRateLimitConfig {
            min_interval: Duration::from_millis(100),
            interval: Duration::from_secs(60),
            max_requests: 2,
        })
    }

    #[test]
    fn rejects_request_within_min_interval() {
        let mut l = limiter();
        let t0 = Instant::now();
        assert!(l.try_acquire(t0).is_ok());
        assert!(l.try_acquire(t0 + Duration::from_millis(10)).is_err());
        assert!(l.try_acquire(t0 + Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn rejects_beyond_max_requests_per_window() {
        let mut l = limiter();
        let t0 = Instant::now();
        assert!(l.try_acquire(t0).is_ok());
        assert!(l.try_acquire(t0 + Duration::from_millis(200)).is_ok());
        assert!(l.try_acquire(t0 + Duration::from_millis(400)).is_err());
    }
}
