//! Source / SourceSet / SourceMap and related conference-wide data types.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::{EndpointId, MediaType};

/// Simulcast/layering hint carried alongside a video source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoType {
    Camera,
    Desktop,
    None,
}

/// A single media stream description, identified by its ssrc within a
/// conference. Owned by exactly one participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub ssrc: u32,
    pub media_type: MediaType,
    pub name: String,
    pub msid: String,
    pub video_type: Option<VideoType>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.ssrc == other.ssrc
    }
}
impl Eq for Source {}
impl std::hash::Hash for Source {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ssrc.hash(state);
    }
}

/// All sources presented by a single participant. Insertion order is
/// irrelevant; equality/uniqueness is by ssrc.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSet(HashSet<Source>);

impl SourceSet {
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    pub fn insert(&mut self, source: Source) -> bool {
        self.0.insert(source)
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) -> Option<Source> {
        let found = self.0.iter().find(|s| s.ssrc == ssrc).cloned();
        if let Some(ref s) = found {
            self.0.remove(s);
        }
        found
    }

    pub fn contains_ssrc(&self, ssrc: u32) -> bool {
        self.0.iter().any(|s| s.ssrc == ssrc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn of_media_type(&self, mt: MediaType) -> impl Iterator<Item = &Source> {
        self.0.iter().filter(move |s| s.media_type == mt)
    }

    pub fn count_of_media_type(&self, mt: MediaType) -> usize {
        self.of_media_type(mt).count()
    }
}

/// Mapping from participant id to its `SourceSet`. Only handed out to
/// consumers outside the owning participant as an immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct SourceMap(HashMap<EndpointId, SourceSet>);

impl SourceMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, id: EndpointId, sources: SourceSet) {
        self.0.insert(id, sources);
    }

    pub fn remove(&mut self, id: &EndpointId) -> Option<SourceSet> {
        self.0.remove(id)
    }

    pub fn get(&self, id: &EndpointId) -> Option<&SourceSet> {
        self.0.get(id)
    }

    pub fn entry(&mut self, id: EndpointId) -> &mut SourceSet {
        self.0.entry(id).or_insert_with(SourceSet::new)
    }

    /// Every other participant's source set, for propagation fan-out.
    pub fn others(&self, exclude: &EndpointId) -> impl Iterator<Item = (&EndpointId, &SourceSet)> {
        self.0.iter().filter(move |(id, _)| *id != exclude)
    }

    /// Immutable snapshot handed to consumers outside the owner.
    pub fn snapshot(&self) -> HashMap<EndpointId, SourceSet> {
        self.0.clone()
    }

    /// Whether `ssrc` is already owned by some participant other than `by`.
    pub fn ssrc_collides(&self, ssrc: u32, by: &EndpointId) -> bool {
        self.0
            .iter()
            .any(|(id, set)| id != by && set.contains_ssrc(ssrc))
    }

    /// Total participant count tracked (conference size, for the source
    /// propagation delay step function).
    pub fn conference_size(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(ssrc: u32, mt: MediaType) -> Source {
        Source { ssrc, media_type: mt, name: format!("s{ssrc}"), msid: "m".into(), video_type: None }
    }

    #[test]
    fn source_set_dedups_by_ssrc() {
        let mut set = SourceSet::new();
        assert!(set.insert(src(1, MediaType::Audio)));
        assert!(!set.insert(src(1, MediaType::Audio)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn source_map_detects_cross_participant_collision() {
        let mut map = SourceMap::new();
        let a = EndpointId::new("a");
        let b = EndpointId::new("b");
        let mut set_a = SourceSet::new();
        set_a.insert(src(42, MediaType::Audio));
        map.set(a.clone(), set_a);

        assert!(map.ssrc_collides(42, &b));
        assert!(!map.ssrc_collides(42, &a));
    }
}
