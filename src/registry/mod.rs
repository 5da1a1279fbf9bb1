//! Roster of optional integrations discovered via brewery presence:
//! recorders, SIP gateways, transcribers.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::StatsId;

/// One detector instance as reported by presence.
#[derive(Debug, Clone)]
pub struct DetectorInstance {
    pub id: StatsId,
    pub region: String,
    pub supports_sip: bool,
    pub supports_transcription: bool,
    pub in_graceful_shutdown: bool,
    pub participant_count: u32,
}

/// Presence-fed roster with capability-filtered, region-preferring selection.
pub struct MeetRegistry {
    instances: Mutex<HashMap<StatsId, DetectorInstance>>,
    local_region: String,
}

impl MeetRegistry {
    pub fn new(local_region: impl Into<String>) -> Self {
        Self { instances: Mutex::new(HashMap::new()), local_region: local_region.into() }
    }

    pub fn update_from_presence(&self, instance: DetectorInstance) {
        self.instances.lock().insert(instance.id.clone(), instance);
    }

    pub fn remove(&self, id: &StatsId) {
        self.instances.lock().remove(id);
    }

    pub fn select_sip_gateway(&self, exclude: &[StatsId], preferred_regions: &[String]) -> Option<StatsId> {
        self.select(exclude, preferred_regions, |i| i.supports_sip)
    }

    pub fn select_transcriber(&self, exclude: &[StatsId], preferred_regions: &[String]) -> Option<StatsId> {
        self.select(exclude, preferred_regions, |i| i.supports_transcription)
    }

    fn select(
        &self,
        exclude: &[StatsId],
        preferred_regions: &[String],
        has_capability: impl Fn(&DetectorInstance) -> bool,
    ) -> Option<StatsId> {
        let instances = self.instances.lock();
        let mut candidates: Vec<&DetectorInstance> = instances
            .values()
            .filter(|i| !i.in_graceful_shutdown)
            .filter(|i| has_capability(i))
            .filter(|i| !exclude.contains(&i.id))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let preferred: Vec<&&DetectorInstance> = candidates
            .iter()
            .filter(|i| preferred_regions.iter().any(|r| r == &i.region))
            .collect();
        if !preferred.is_empty() {
            candidates = preferred.into_iter().copied().collect();
        } else {
            let local: Vec<&&DetectorInstance> =
                candidates.iter().filter(|i| i.region == self.local_region).collect();
            if !local.is_empty() {
                candidates = local.into_iter().copied().collect();
            }
        }

        candidates
            .into_iter()
            .min_by(|a, b| a.participant_count.cmp(&b.participant_count).then(a.id.0.cmp(&b.id.0)))
            .map(|i| i.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(id: &str, region: &str, sip: bool, count: u32) -> DetectorInstance {
        DetectorInstance {
            id: StatsId::new(id),
            region: region.into(),
            supports_sip: sip,
            supports_transcription: false,
            in_graceful_shutdown: false,
            participant_count: count,
        }
    }

    #[test]
    fn prefers_preferred_region_then_fewest_participants() {
        let reg = MeetRegistry::new("eu");
        reg.update_from_presence(inst("g1", "us", true, 2));
        reg.update_from_presence(inst("g2", "us", true, 1));
        reg.update_from_presence(inst("g3", "eu", true, 5));
        let chosen = reg.select_sip_gateway(&[], &["us".to_string()]);
        assert_eq!(chosen, Some(StatsId::new("g2")));
    }

    #[test]
    fn falls_back_to_local_region_without_preferred_match() {
        let reg = MeetRegistry::new("eu");
        reg.update_from_presence(inst("g1", "us", true, 1));
        reg.update_from_presence(inst("g2", "eu", true, 3));
        let chosen = reg.select_sip_gateway(&[], &["apac".to_string()]);
        assert_eq!(chosen, Some(StatsId::new("g2")));
    }

    #[test]
    fn excludes_graceful_shutdown_instances() {
        let reg = MeetRegistry::new("eu");
        let mut shutting = inst("g1", "eu", true, 0);
        shutting.in_graceful_shutdown = true;
        reg.update_from_presence(shutting);
        reg.update_from_presence(inst("g2", "eu", true, 2));
        assert_eq!(reg.select_sip_gateway(&[], &[]), Some(StatsId::new("g2")));
    }
}
