// ── Field: Theme Builder ────────────────────────────────────────────────────
//
// Clusters co-occurrence neighbourhoods into "islands" of tokens that show
// up together. Rebuilds are wholesale and expensive (vocab × avg degree),
// so they only run on the ingest schedule or maintenance timer; activation
// against a prompt is cheap and runs on every generation.
//
// Build:
//   1. Seeds: non-punctuation tokens with ≥ min_neighbors distinct neighbours
//      and ≥ min_total_cooccur total co-occurrence mass, heaviest first.
//   2. Each seed's neighbourhood (seed + neighbours) merges into the existing
//      theme it overlaps most (Jaccard ≥ merge_overlap), else starts a new one.
//   3. Membership is made exclusive: a token stays in the first theme that
//      claimed it.

use crate::atoms::constants::is_punctuation;
use crate::atoms::field_types::{ThemeConfig, TokenId};
use crate::engine::ledger::Ledger;
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Theme {
    pub id: usize,
    pub members: BTreeSet<TokenId>,
    /// Total co-occurrence mass of the seeds merged into this theme.
    pub mass: u64,
}

/// Result of one rebuild. `generation` increments on every rebuild so
/// activation history from older builds can be discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThemeSet {
    pub themes: Vec<Theme>,
    pub token_to_theme: HashMap<TokenId, usize>,
    pub generation: u64,
}

impl ThemeSet {
    pub fn len(&self) -> usize {
        self.themes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }

    pub fn theme_of(&self, token: TokenId) -> Option<usize> {
        self.token_to_theme.get(&token).copied()
    }
}

pub struct ThemeBuilder<'a> {
    config: &'a ThemeConfig,
}

impl<'a> ThemeBuilder<'a> {
    pub fn new(config: &'a ThemeConfig) -> Self {
        Self { config }
    }

    /// Rebuild all themes from the ledger's co-occurrence table.
    pub fn rebuild(&self, ledger: &Ledger, generation: u64) -> ThemeSet {
        let word = |id: TokenId| ledger.token(id).is_some_and(|t| !is_punctuation(t));

        let mut seeds: Vec<(TokenId, u64, BTreeSet<TokenId>)> = ledger
            .cooccurrence()
            .iter()
            .filter(|(id, _)| word(**id))
            .filter_map(|(&id, row)| {
                let hood: BTreeSet<TokenId> =
                    row.iter().filter(|(n, c)| **c > 0 && word(**n)).map(|(n, _)| *n).collect();
                let mass: u64 = row.values().sum();
                (hood.len() >= self.config.min_neighbors && mass >= self.config.min_total_cooccur)
                    .then_some((id, mass, hood))
            })
            .collect();
        seeds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut clusters: Vec<(BTreeSet<TokenId>, u64)> = Vec::new();
        for (seed, mass, mut hood) in seeds {
            hood.insert(seed);
            let best = clusters
                .iter()
                .enumerate()
                .map(|(i, (members, _))| (i, jaccard(members, &hood)))
                .filter(|(_, j)| *j >= self.config.merge_overlap)
                .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
            match best {
                Some((i, _)) => {
                    clusters[i].0.extend(hood);
                    clusters[i].1 += mass;
                }
                None => clusters.push((hood, mass)),
            }
        }

        let mut claimed: HashSet<TokenId> = HashSet::new();
        let mut themes = Vec::new();
        let mut token_to_theme = HashMap::new();
        for (members, mass) in clusters {
            let exclusive: BTreeSet<TokenId> =
                members.into_iter().filter(|t| claimed.insert(*t)).collect();
            if exclusive.len() < 2 {
                continue;
            }
            let id = themes.len();
            for t in &exclusive {
                token_to_theme.insert(*t, id);
            }
            themes.push(Theme { id, members: exclusive, mass });
        }

        debug!(
            "[themes] Rebuilt generation {}: {} themes covering {} tokens",
            generation,
            themes.len(),
            token_to_theme.len()
        );
        ThemeSet { themes, token_to_theme, generation }
    }
}

fn jaccard(a: &BTreeSet<TokenId>, b: &BTreeSet<TokenId>) -> f32 {
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    if union == 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Activation
// ═════════════════════════════════════════════════════════════════════════════

/// Theme activation for one prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveThemes {
    /// (theme id, score) for every theme the prompt touched, best first.
    pub scores: Vec<(usize, f32)>,
    /// Fraction of all themes that are active above the minimum score.
    pub active_ratio: f32,
    min_active_score: f32,
}

impl ActiveThemes {
    /// Themes at or above the minimum activation score.
    pub fn active(&self) -> impl Iterator<Item = &(usize, f32)> + '_ {
        self.scores.iter().filter(move |(_, s)| *s >= self.min_active_score)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Member token → strongest activation of the theme it belongs to.
    pub fn word_bias(&self, themes: &ThemeSet) -> HashMap<TokenId, f32> {
        let mut bias = HashMap::new();
        for &(id, score) in self.active() {
            if let Some(theme) = themes.themes.get(id) {
                for t in &theme.members {
                    let slot = bias.entry(*t).or_insert(0.0f32);
                    *slot = slot.max(score);
                }
            }
        }
        bias
    }
}

/// Score each theme by the share of distinct prompt tokens it contains.
pub fn activate(prompt_ids: &[TokenId], themes: &ThemeSet, config: &ThemeConfig) -> ActiveThemes {
    let distinct: HashSet<TokenId> = prompt_ids.iter().copied().collect();
    let mut hits: HashMap<usize, usize> = HashMap::new();
    for t in &distinct {
        if let Some(theme) = themes.theme_of(*t) {
            *hits.entry(theme).or_insert(0) += 1;
        }
    }
    let mut scores: Vec<(usize, f32)> = hits
        .into_iter()
        .map(|(id, n)| (id, n as f32 / distinct.len().max(1) as f32))
        .collect();
    scores.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut active = ActiveThemes { scores, active_ratio: 0.0, min_active_score: config.min_active_score };
    if !themes.is_empty() {
        active.active_ratio = active.active_count() as f32 / themes.len() as f32;
    }
    active
}

// ═════════════════════════════════════════════════════════════════════════════
// Flow
// ═════════════════════════════════════════════════════════════════════════════

/// Tracks how theme activation moves between consecutive generations.
#[derive(Debug, Clone, Default)]
pub struct ThemeFlow {
    generation: u64,
    previous: HashMap<usize, f32>,
}

/// Largest rise and largest fall of any theme since the last observation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowScores {
    pub emerging: f32,
    pub fading: f32,
}

impl ThemeFlow {
    pub fn observe(&mut self, active: &ActiveThemes, themes: &ThemeSet) -> FlowScores {
        if themes.generation != self.generation {
            self.previous.clear();
            self.generation = themes.generation;
        }
        let current: HashMap<usize, f32> = active.scores.iter().copied().collect();
        let mut scores = FlowScores::default();
        for (id, now) in &current {
            let before = self.previous.get(id).copied().unwrap_or(0.0);
            scores.emerging = scores.emerging.max(now - before);
        }
        for (id, before) in &self.previous {
            let now = current.get(id).copied().unwrap_or(0.0);
            scores.fading = scores.fading.max(before - now);
        }
        scores.emerging = scores.emerging.clamp(0.0, 1.0);
        scores.fading = scores.fading.clamp(0.0, 1.0);
        self.previous = current;
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::field_types::LedgerConfig;
    use crate::engine::tokenizer::tokenize;

    fn animal_ledger() -> Ledger {
        let mut l = Ledger::new();
        let cfg = LedgerConfig::default();
        for _ in 0..3 {
            l.ingest(&tokenize("cat animal pet meow fur tail"), &cfg);
            l.ingest(&tokenize("dog animal pet bark fur tail"), &cfg);
        }
        for _ in 0..3 {
            l.ingest(&tokenize("rain cloud storm wind thunder sky"), &cfg);
        }
        l
    }

    fn cfg() -> ThemeConfig {
        ThemeConfig::default()
    }

    #[test]
    fn empty_ledger_has_no_themes() {
        let set = ThemeBuilder::new(&cfg()).rebuild(&Ledger::new(), 1);
        assert!(set.is_empty());
        assert!(set.token_to_theme.is_empty());
    }

    #[test]
    fn separate_clusters_become_separate_themes() {
        let l = animal_ledger();
        let set = ThemeBuilder::new(&cfg()).rebuild(&l, 1);
        let cat = set.theme_of(l.id("cat").unwrap());
        let dog = set.theme_of(l.id("dog").unwrap());
        let rain = set.theme_of(l.id("rain").unwrap());
        assert!(cat.is_some() && rain.is_some());
        assert_eq!(cat, dog);
        assert_ne!(cat, rain);
    }

    #[test]
    fn membership_is_exclusive() {
        let l = animal_ledger();
        let set = ThemeBuilder::new(&cfg()).rebuild(&l, 1);
        let mut seen = HashSet::new();
        for theme in &set.themes {
            for t in &theme.members {
                assert!(seen.insert(*t), "token {t} in two themes");
            }
        }
    }

    #[test]
    fn activation_scores_prompt_overlap() {
        let l = animal_ledger();
        let set = ThemeBuilder::new(&cfg()).rebuild(&l, 1);
        let ids: Vec<TokenId> = ["cat", "storm"].iter().filter_map(|t| l.id(t)).collect();
        let active = activate(&ids, &set, &cfg());
        assert_eq!(active.active_count(), 2);
        assert!(active.scores.iter().all(|(_, s)| (*s - 0.5).abs() < 1e-6));
        let bias = active.word_bias(&set);
        assert!(bias.contains_key(&l.id("thunder").unwrap()));
    }

    #[test]
    fn flow_reports_rise_then_fall() {
        let l = animal_ledger();
        let set = ThemeBuilder::new(&cfg()).rebuild(&l, 1);
        let mut flow = ThemeFlow::default();
        let cat: Vec<TokenId> = l.id("cat").into_iter().collect();
        let first = flow.observe(&activate(&cat, &set, &cfg()), &set);
        assert_eq!(first.emerging, 1.0);
        let second = flow.observe(&activate(&[], &set, &cfg()), &set);
        assert_eq!(second.fading, 1.0);
        assert_eq!(second.emerging, 0.0);
    }
}
