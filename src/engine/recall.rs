// ── Field: Resonant Recall ──────────────────────────────────────────────────
//
// Bounded store of past good replies. Recall scores each snapshot against
// the current prompt:
//
//   score = overlap_weight · jaccard(prompt tokens, snapshot tokens)
//         + theme_weight   · jaccard(prompt themes, snapshot themes)
//         + arousal_weight · (1 − |prompt arousal − snapshot charge|)
//         + quality_weight · quality · (1 − strength · recency_penalty)
//
//   recency_penalty = max(0, 1 − hours_since_last_use / window)
//
// Only snapshots with some lexical or theme relevance that clear
// `min_score` are candidates; no candidates means no recall. With
// probability `misfire_probability`, and only when more than one candidate
// scored, a uniformly random candidate wins instead of the best one. The winner's use stats are updated by the caller through
// the concurrency guard (`SnapshotStore::touch`).
//
// Capacity is enforced on insert: the lowest-quality snapshot goes first,
// oldest first among equals.

use crate::atoms::field_types::{RecallConfig, Snapshot, TokenId};
use crate::atoms::traits::WriteOp;
use crate::engine::ledger::Ledger;
use crate::engine::themes::ThemeSet;
use crate::engine::tokenizer::tokenize;
use rand::Rng;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct Entry {
    snapshot: Snapshot,
    tokens: HashSet<String>,
}

impl Entry {
    fn new(snapshot: Snapshot) -> Self {
        let tokens = tokenize(&snapshot.text).into_iter().collect();
        Self { snapshot, tokens }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    entries: Vec<Entry>,
    next_id: i64,
}

/// What recall produced for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallHit {
    /// Winning snapshot (the one whose use stats get touched).
    pub winner: i64,
    /// Returned snapshots, best first, with their scores.
    pub memories: Vec<(Snapshot, f32)>,
    pub misfire: bool,
}

impl RecallHit {
    pub fn texts(&self) -> Vec<&str> {
        self.memories.iter().map(|(s, _)| s.text.as_str()).collect()
    }

    /// Token boosts for the generator: each known token of a recalled
    /// snapshot gets `alpha × score / best score`.
    pub fn token_boosts(&self, ledger: &Ledger, alpha: f32) -> HashMap<TokenId, f32> {
        let best = self.memories.iter().map(|(_, s)| *s).fold(0.0f32, f32::max).max(f32::EPSILON);
        let mut boosts = HashMap::new();
        for (snapshot, score) in &self.memories {
            let strength = alpha * (score / best).clamp(0.0, 1.0);
            for tok in tokenize(&snapshot.text) {
                if let Some(id) = ledger.id(&tok) {
                    let slot = boosts.entry(id).or_insert(0.0f32);
                    *slot = slot.max(strength);
                }
            }
        }
        boosts
    }
}

/// Context the scorer needs about the current prompt.
pub struct RecallQuery<'a> {
    pub prompt_tokens: &'a [String],
    pub arousal: f32,
    pub ledger: &'a Ledger,
    pub themes: &'a ThemeSet,
    /// Unix seconds.
    pub now: i64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self { entries: Vec::new(), next_id: 1 }
    }

    /// Rebuild from persisted rows.
    pub fn from_snapshots(snapshots: Vec<Snapshot>) -> Self {
        let next_id = snapshots.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        Self { entries: snapshots.into_iter().map(Entry::new).collect(), next_id }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Snapshot> {
        self.entries.iter().find(|e| e.snapshot.id == id).map(|e| &e.snapshot)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter().map(|e| &e.snapshot)
    }

    /// Add a snapshot, evicting down to `capacity`. Returns the stored
    /// snapshot and the write batch (insert plus any evictions).
    pub fn insert(
        &mut self,
        text: &str,
        quality: f32,
        emotional: f32,
        now: i64,
        capacity: usize,
    ) -> (Snapshot, Vec<WriteOp>) {
        let snapshot = Snapshot {
            id: self.next_id,
            text: text.to_string(),
            quality: quality.clamp(0.0, 1.0),
            emotional: emotional.clamp(0.0, 1.0),
            created_at: now,
            last_used_at: None,
            use_count: 0,
        };
        self.next_id += 1;
        self.entries.push(Entry::new(snapshot.clone()));

        let mut evicted = Vec::new();
        while self.entries.len() > capacity.max(1) {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.snapshot
                        .quality
                        .total_cmp(&b.snapshot.quality)
                        .then(a.snapshot.created_at.cmp(&b.snapshot.created_at))
                        .then(a.snapshot.id.cmp(&b.snapshot.id))
                })
                .map(|(i, _)| i);
            match victim {
                Some(i) => evicted.push(self.entries.remove(i).snapshot.id),
                None => break,
            }
        }

        let mut batch = vec![WriteOp::InsertSnapshot(snapshot.clone())];
        if !evicted.is_empty() {
            batch.push(WriteOp::DeleteSnapshots(evicted));
        }
        (snapshot, batch)
    }

    /// Record a recall win.
    pub fn touch(&mut self, id: i64, now: i64) -> Option<WriteOp> {
        let entry = self.entries.iter_mut().find(|e| e.snapshot.id == id)?;
        entry.snapshot.last_used_at = Some(now);
        entry.snapshot.use_count = entry.snapshot.use_count.saturating_add(1);
        Some(WriteOp::TouchSnapshot { id, last_used_at: now, use_count: entry.snapshot.use_count })
    }

    /// Score every snapshot against the prompt. Pure; see module docs.
    pub fn recall<R: Rng + ?Sized>(
        &self,
        query: &RecallQuery<'_>,
        config: &RecallConfig,
        rng: &mut R,
    ) -> Option<RecallHit> {
        if self.entries.is_empty() || config.max_memories == 0 {
            return None;
        }
        let prompt: HashSet<&str> = query.prompt_tokens.iter().map(String::as_str).collect();
        let prompt_themes = theme_ids(prompt.iter().copied(), query.ledger, query.themes);

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let overlap = jaccard_str(&prompt, &e.tokens);
                let snap_themes = theme_ids(e.tokens.iter().map(String::as_str), query.ledger, query.themes);
                let theme = jaccard_ids(&prompt_themes, &snap_themes);
                if overlap <= 0.0 && theme <= 0.0 {
                    return None;
                }
                let proximity = 1.0 - (query.arousal - e.snapshot.emotional).abs().min(1.0);
                let freshness = 1.0 - config.recency_penalty_strength * recency_penalty(&e.snapshot, query.now, config);
                let score = config.overlap_weight * overlap
                    + config.theme_weight * theme
                    + config.arousal_weight * proximity
                    + config.quality_weight * e.snapshot.quality * freshness;
                (score >= config.min_score).then_some((i, score))
            })
            .collect();
        if scored.is_empty() {
            return None;
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if scored.len() > 1 && rng.gen_bool(config.misfire_probability.clamp(0.0, 1.0)) {
            let (pick, score) = scored[rng.gen_range(0..scored.len())];
            let snapshot = self.entries[pick].snapshot.clone();
            return Some(RecallHit { winner: snapshot.id, memories: vec![(snapshot, score)], misfire: true });
        }

        scored.truncate(config.max_memories);
        let (best, _) = *scored.first()?;
        Some(RecallHit {
            winner: self.entries[best].snapshot.id,
            memories: scored.into_iter().map(|(i, s)| (self.entries[i].snapshot.clone(), s)).collect(),
            misfire: false,
        })
    }
}

/// 1 right after use, falling linearly to 0 at the end of the window.
pub fn recency_penalty(snapshot: &Snapshot, now: i64, config: &RecallConfig) -> f32 {
    let Some(last) = snapshot.last_used_at else {
        return 0.0;
    };
    if config.recency_window_hours <= 0.0 {
        return 0.0;
    }
    let elapsed_hours = (now - last).max(0) as f64 / 3600.0;
    (1.0 - elapsed_hours / config.recency_window_hours).max(0.0) as f32
}

fn theme_ids<'a>(tokens: impl Iterator<Item = &'a str>, ledger: &Ledger, themes: &ThemeSet) -> HashSet<usize> {
    tokens.filter_map(|t| ledger.id(t)).filter_map(|id| themes.theme_of(id)).collect()
}

fn jaccard_str(a: &HashSet<&str>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.iter().filter(|t| b.contains(**t)).count();
    let union = a.len() + b.len() - inter;
    inter as f32 / union as f32
}

fn jaccard_ids(a: &HashSet<usize>, b: &HashSet<usize>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    inter as f32 / (a.len() + b.len() - inter) as f32
}
