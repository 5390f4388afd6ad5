// ── Field: Episodic Memory ──────────────────────────────────────────────────
//
// One fixed-width feature vector per recorded exchange: the 16 persisted
// scalars followed by the expert one-hot (21 dims). Similarity lookup is a
// brute-force cosine scan over an in-memory index that mirrors the newest
// `capacity` rows of the episode store.
//
// Lookups never fail: an empty index or a malformed query vector simply
// yields no results.

use crate::atoms::constants::FEATURE_DIM;
use crate::atoms::field_types::{feature_vector, Episode};
use log::debug;
use std::collections::VecDeque;

/// Validated query/storage vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    /// `None` for the wrong width, non-finite values or a zero vector.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        if values.len() != FEATURE_DIM || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if values.iter().all(|v| *v == 0.0) {
            return None;
        }
        Some(Self(values.to_vec()))
    }

    pub fn of(episode: &Episode) -> Option<Self> {
        Self::from_slice(&feature_vector(&episode.features.sanitized(), episode.expert))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn cosine(&self, other: &FeatureVector) -> f64 {
        cosine_similarity(&self.0, &other.0)
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

#[derive(Debug, Clone)]
struct Indexed {
    episode: Episode,
    vector: FeatureVector,
}

/// In-memory similarity index over recent episodes.
#[derive(Debug, Clone, Default)]
pub struct EpisodicMemory {
    rows: VecDeque<Indexed>,
    capacity: usize,
}

impl EpisodicMemory {
    pub fn new(capacity: usize) -> Self {
        Self { rows: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Index episodes loaded from storage (oldest first).
    pub fn from_episodes(episodes: Vec<Episode>, capacity: usize) -> Self {
        let mut memory = Self::new(capacity);
        for ep in episodes {
            memory.record(ep);
        }
        memory
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add an episode to the index. Episodes whose vector is degenerate are
    /// kept out of the index (they could never match anything).
    pub fn record(&mut self, episode: Episode) -> bool {
        let Some(vector) = FeatureVector::of(&episode) else {
            debug!("[episodes] Skipping episode {} with degenerate features", episode.id);
            return false;
        };
        self.rows.push_back(Indexed { episode, vector });
        while self.rows.len() > self.capacity {
            self.rows.pop_front();
        }
        true
    }

    /// Top `top_k` episodes by cosine similarity with `query`, filtered by
    /// `min_quality`, best first.
    pub fn query_similar(&self, query: &[f32], top_k: usize, min_quality: f32) -> Vec<(Episode, f32)> {
        if top_k == 0 || self.rows.is_empty() {
            return Vec::new();
        }
        let Some(query) = FeatureVector::from_slice(query) else {
            return Vec::new();
        };
        let mut hits: Vec<(&Indexed, f64)> = self
            .rows
            .iter()
            .filter(|r| r.episode.quality >= min_quality)
            .map(|r| (r, query.cosine(&r.vector)))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.episode.id.cmp(&a.0.episode.id)));
        hits.truncate(top_k);
        hits.into_iter().map(|(r, s)| (r.episode.clone(), s as f32)).collect()
    }
}
