// ── Lexfield Atoms: Field Types ────────────────────────────────────────────
// Plain data shared by every engine layer: token ids, the presence pulse,
// expert profiles, snapshots, episodes, and the full `FieldConfig`.
// No I/O and no engine imports here.

use crate::atoms::constants::{EPISODE_SCALAR_FEATURES, EXPERT_COUNT, FEATURE_DIM};
use crate::atoms::error::{FieldError, FieldResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Interned token id. Ids are assigned densely from 0 and never reused.
pub type TokenId = u32;

// ═════════════════════════════════════════════════════════════════════════════
// Presence Pulse
// ═════════════════════════════════════════════════════════════════════════════

/// Presence metrics for one exchange. Every field is in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PresencePulse {
    /// Fraction of prompt trigrams the ledger has never seen.
    pub novelty: f32,
    /// Heuristic emotional charge of the prompt.
    pub arousal: f32,
    /// Normalized Shannon entropy (natural log) of the tail continuation.
    pub entropy: f32,
    /// Convex combination of the three above.
    pub pulse: f32,
}

// ═════════════════════════════════════════════════════════════════════════════
// Experts
// ═════════════════════════════════════════════════════════════════════════════

/// Closed set of generation profiles. Order matches the one-hot encoding
/// used in episode feature vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expert {
    Structural,
    Semantic,
    Creative,
    Precise,
    Wounded,
}

/// Sampling parameters attached to an expert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpertProfile {
    pub expert: Expert,
    /// Higher = flatter distribution.
    pub temperature: f32,
    /// Weight of active-theme bias in the walk, 0..1.
    pub semantic_weight: f32,
    pub description: &'static str,
}

const PROFILES: [ExpertProfile; EXPERT_COUNT] = [
    ExpertProfile {
        expert: Expert::Structural,
        temperature: 0.8,
        semantic_weight: 0.2,
        description: "default grammar-following walk",
    },
    ExpertProfile {
        expert: Expert::Semantic,
        temperature: 1.0,
        semantic_weight: 0.5,
        description: "several themes active; lean into topical clusters",
    },
    ExpertProfile {
        expert: Expert::Creative,
        temperature: 1.3,
        semantic_weight: 0.4,
        description: "unfamiliar prompt; explore the field",
    },
    ExpertProfile {
        expert: Expert::Precise,
        temperature: 0.6,
        semantic_weight: 0.3,
        description: "low-entropy continuation; stay close to strong edges",
    },
    ExpertProfile {
        expert: Expert::Wounded,
        temperature: 0.9,
        semantic_weight: 0.6,
        description: "identity pressure; slow down and hold to themes",
    },
];

impl Expert {
    pub const ALL: [Expert; EXPERT_COUNT] = [
        Expert::Structural,
        Expert::Semantic,
        Expert::Creative,
        Expert::Precise,
        Expert::Wounded,
    ];

    /// Position in the one-hot encoding.
    pub fn index(self) -> usize {
        match self {
            Expert::Structural => 0,
            Expert::Semantic => 1,
            Expert::Creative => 2,
            Expert::Precise => 3,
            Expert::Wounded => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Expert::Structural => "structural",
            Expert::Semantic => "semantic",
            Expert::Creative => "creative",
            Expert::Precise => "precise",
            Expert::Wounded => "wounded",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    pub fn profile(self) -> ExpertProfile {
        PROFILES[self.index()]
    }

    pub fn one_hot(self) -> [f32; EXPERT_COUNT] {
        let mut v = [0.0; EXPERT_COUNT];
        v[self.index()] = 1.0;
        v
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Snapshots
// ═════════════════════════════════════════════════════════════════════════════

/// A past output kept for resonant recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub text: String,
    /// Quality in [0, 1] at save time.
    pub quality: f32,
    /// Arousal of the exchange that produced it.
    pub emotional: f32,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds of the last recall win, `None` if never recalled.
    pub last_used_at: Option<i64>,
    pub use_count: u32,
}

// ═════════════════════════════════════════════════════════════════════════════
// Episodes
// ═════════════════════════════════════════════════════════════════════════════

/// The persisted scalar features of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EpisodeFeatures {
    pub entropy: f32,
    pub novelty: f32,
    pub arousal: f32,
    pub pulse: f32,
    pub trauma_level: f32,
    /// Active themes / total themes.
    pub active_themes: f32,
    pub emerging_score: f32,
    pub fading_score: f32,
    pub reply_len_norm: f32,
    pub unique_ratio: f32,
    /// Expert temperature, 0..2.
    pub expert_temp: f32,
    pub expert_semantic: f32,
    /// 1.0 when recalled snapshots biased the walk.
    pub recall_used: f32,
    /// 1.0 when recall picked a random snapshot.
    pub misfire: f32,
    pub prompt_len_norm: f32,
    /// 1.0 for echo-mode diagnostics.
    pub echo: f32,
}

impl EpisodeFeatures {
    pub fn to_scalars(&self) -> [f32; EPISODE_SCALAR_FEATURES] {
        [
            self.entropy,
            self.novelty,
            self.arousal,
            self.pulse,
            self.trauma_level,
            self.active_themes,
            self.emerging_score,
            self.fading_score,
            self.reply_len_norm,
            self.unique_ratio,
            self.expert_temp,
            self.expert_semantic,
            self.recall_used,
            self.misfire,
            self.prompt_len_norm,
            self.echo,
        ]
    }

    pub fn from_scalars(s: &[f32; EPISODE_SCALAR_FEATURES]) -> Self {
        Self {
            entropy: s[0],
            novelty: s[1],
            arousal: s[2],
            pulse: s[3],
            trauma_level: s[4],
            active_themes: s[5],
            emerging_score: s[6],
            fading_score: s[7],
            reply_len_norm: s[8],
            unique_ratio: s[9],
            expert_temp: s[10],
            expert_semantic: s[11],
            recall_used: s[12],
            misfire: s[13],
            prompt_len_norm: s[14],
            echo: s[15],
        }
    }

    /// Clamp every feature into its documented range; NaN becomes 0.
    pub fn sanitized(&self) -> Self {
        fn clamp(x: f32, max: f32) -> f32 {
            if x.is_nan() {
                0.0
            } else {
                x.clamp(0.0, max)
            }
        }
        let mut s = self.to_scalars();
        for (i, v) in s.iter_mut().enumerate() {
            // index 10 is expert_temp
            *v = clamp(*v, if i == 10 { 2.0 } else { 1.0 });
        }
        Self::from_scalars(&s)
    }
}

/// One recorded exchange. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    /// Unix seconds.
    pub created_at: i64,
    pub prompt: String,
    pub reply: String,
    pub features: EpisodeFeatures,
    pub expert: Expert,
    pub quality: f32,
}

impl Episode {
    /// Scalars followed by the expert one-hot (`FEATURE_DIM` wide).
    pub fn feature_vector(&self) -> Vec<f32> {
        feature_vector(&self.features, self.expert)
    }
}

/// Build the query/storage vector for a feature set and expert.
pub fn feature_vector(features: &EpisodeFeatures, expert: Expert) -> Vec<f32> {
    let mut v = Vec::with_capacity(FEATURE_DIM);
    v.extend_from_slice(&features.to_scalars());
    v.extend_from_slice(&expert.one_hot());
    v
}

// ═════════════════════════════════════════════════════════════════════════════
// Stats
// ═════════════════════════════════════════════════════════════════════════════

/// Summary counts for a field instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub vocab: usize,
    pub bigrams: usize,
    pub trigrams: usize,
    pub cooccurrences: usize,
    pub themes: usize,
    pub snapshots: usize,
    pub episodes: usize,
    pub ingest_count: u64,
    /// Rows waiting in the write-back queue after failed writes.
    pub pending_writes: usize,
    pub episodic_available: bool,
}

// ═════════════════════════════════════════════════════════════════════════════
// Configuration
// ═════════════════════════════════════════════════════════════════════════════

/// Ledger ingest tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Co-occurrence window radius (tokens on each side).
    pub cooccur_window: usize,
    /// Initial co-occurrence count when a pair involves a token created in
    /// the same ingest call.
    pub novelty_initial_count: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { cooccur_window: 5, novelty_initial_count: 2 }
    }
}

/// Tiered co-occurrence eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Run decay every N ingests. 0 disables scheduled decay.
    pub interval_ingests: u64,
    /// Edges whose post-decay count falls below this are deleted.
    pub min_threshold: u64,
    /// Lowest count in the middle tier.
    pub middle_from: u64,
    /// Lowest count in the deep tier.
    pub deep_from: u64,
    pub surface_factor: f64,
    pub middle_factor: f64,
    pub deep_factor: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            interval_ingests: 100,
            min_threshold: 1,
            middle_from: 5,
            deep_from: 50,
            surface_factor: 0.90,
            middle_factor: 0.95,
            deep_factor: 0.998,
        }
    }
}

/// Theme clustering thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    /// Minimum distinct co-occurrence neighbours for a seed token.
    pub min_neighbors: usize,
    /// Minimum total co-occurrence mass of a seed neighbourhood.
    pub min_total_cooccur: u64,
    /// Jaccard overlap above which a neighbourhood merges into an existing theme.
    pub merge_overlap: f32,
    /// Rebuild every N ingests. 0 disables scheduled rebuilds.
    pub rebuild_interval_ingests: u64,
    /// Minimum activation score for a theme to count as active.
    pub min_active_score: f32,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            min_neighbors: 5,
            min_total_cooccur: 10,
            merge_overlap: 0.5,
            rebuild_interval_ingests: 10,
            min_active_score: 0.2,
        }
    }
}

/// Presence-metric weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub novelty_weight: f32,
    pub arousal_weight: f32,
    pub entropy_weight: f32,
    /// Per-token falloff of emphasis signals with distance from the prompt end.
    pub arousal_distance_decay: f32,
    /// Look-back window for repetition.
    pub repetition_window: usize,
    pub caps_weight: f32,
    pub exclamation_weight: f32,
    pub question_weight: f32,
    pub repetition_weight: f32,
    /// Weight of the learned per-token emotion map.
    pub emotion_map_weight: f32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            novelty_weight: 0.3,
            arousal_weight: 0.4,
            entropy_weight: 0.3,
            arousal_distance_decay: 0.85,
            repetition_window: 4,
            caps_weight: 0.35,
            exclamation_weight: 0.45,
            question_weight: 0.15,
            repetition_weight: 0.3,
            emotion_map_weight: 0.25,
        }
    }
}

/// Router thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub trauma_threshold: f32,
    pub novelty_high: f32,
    pub entropy_low: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { trauma_threshold: 0.7, novelty_high: 0.7, entropy_low: 0.3 }
    }
}

/// Walk parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    /// How many highest-out-degree tokens form the start pool.
    pub center_count: usize,
    /// Multiplicative boost for candidates that appear in the prompt.
    pub prompt_gravity: f32,
    /// Returned when nothing can be generated.
    pub fallback_reply: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 80,
            center_count: 7,
            prompt_gravity: 0.25,
            fallback_reply: "...".into(),
        }
    }
}

/// Snapshot store and recall scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub capacity: usize,
    pub recency_window_hours: f64,
    pub recency_penalty_strength: f32,
    pub misfire_probability: f64,
    pub min_score: f32,
    pub max_memories: usize,
    /// Overall strength of the token boosts handed to the generator.
    pub alpha: f32,
    pub save_quality_threshold: f32,
    pub overlap_weight: f32,
    pub theme_weight: f32,
    pub arousal_weight: f32,
    pub quality_weight: f32,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            recency_window_hours: 24.0,
            recency_penalty_strength: 0.5,
            misfire_probability: 0.15,
            min_score: 0.1,
            max_memories: 5,
            alpha: 0.3,
            save_quality_threshold: 0.6,
            overlap_weight: 0.4,
            theme_weight: 0.2,
            arousal_weight: 0.2,
            quality_weight: 0.2,
        }
    }
}

/// Episodic memory bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeConfig {
    pub capacity: usize,
    pub default_top_k: usize,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self { capacity: 4096, default_top_k: 5 }
    }
}

/// Identity-pressure tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraumaConfig {
    pub half_life_hours: f64,
    pub event_threshold: f32,
    /// Phrases that add a fixed bump when present in the exchange.
    pub trigger_phrases: Vec<String>,
}

impl Default for TraumaConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 24.0,
            event_threshold: 0.3,
            trigger_phrases: vec![
                "who are you".into(),
                "who am i".into(),
                "are you real".into(),
            ],
        }
    }
}

/// Repetition tracking over recent replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Recent reply tokens kept for n-gram counting.
    pub window_tokens: usize,
    pub ngram: usize,
    /// An n-gram seen more often than this inside the window is a repeat.
    pub repeat_threshold: usize,
    /// Repeats at which the loop score saturates at 1.
    pub saturation: usize,
    /// Share of the quality score a saturated loop score takes away.
    pub quality_penalty: f32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { window_tokens: 500, ngram: 5, repeat_threshold: 2, saturation: 5, quality_penalty: 0.5 }
    }
}

/// One internal reflection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub semantic_weight: f32,
    /// Seed with the reply only instead of prompt and reply.
    pub reply_only: bool,
}

/// Unseen generations run after each exchange and ingested back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    pub rings: Vec<RingConfig>,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        let ring = |max_tokens, temperature, semantic_weight, reply_only| RingConfig {
            max_tokens,
            temperature,
            semantic_weight,
            reply_only,
        };
        Self {
            enabled: false,
            rings: vec![ring(30, 0.8, 0.2, false), ring(40, 1.0, 0.5, true), ring(20, 1.2, 0.4, true)],
        }
    }
}

/// Top-level configuration for one field instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// SQLite file for this instance. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Return internal errors from `ingest` instead of swallowing them.
    pub surface_errors: bool,
    /// Seed for the sampling RNG; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Seed text ingested once into an empty field; also the identity
    /// lexicon for trauma tracking.
    pub bootstrap_text: Option<String>,
    pub ledger: LedgerConfig,
    pub decay: DecayConfig,
    pub themes: ThemeConfig,
    pub presence: PresenceConfig,
    pub router: RouterConfig,
    pub generation: GenerationConfig,
    pub recall: RecallConfig,
    pub episodes: EpisodeConfig,
    pub trauma: TraumaConfig,
    pub loops: LoopConfig,
    pub reflection: ReflectionConfig,
}

impl FieldConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> FieldResult<Self> {
        let config: FieldConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> FieldResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations that would break invariants.
    pub fn validate(&self) -> FieldResult<()> {
        let d = &self.decay;
        for (name, f) in [
            ("surface_factor", d.surface_factor),
            ("middle_factor", d.middle_factor),
            ("deep_factor", d.deep_factor),
        ] {
            if !(0.0..=1.0).contains(&f) {
                return Err(FieldError::Config(format!("decay.{name} must be within [0, 1], got {f}")));
            }
        }
        if d.middle_from == 0 || d.deep_from <= d.middle_from {
            return Err(FieldError::Config(
                "decay tiers must satisfy 0 < middle_from < deep_from".into(),
            ));
        }
        let p = &self.presence;
        let sum = p.novelty_weight + p.arousal_weight + p.entropy_weight;
        if p.novelty_weight < 0.0 || p.arousal_weight < 0.0 || p.entropy_weight < 0.0 || (sum - 1.0).abs() > 1e-3 {
            return Err(FieldError::Config(format!(
                "presence weights must be non-negative and sum to 1, got {sum}"
            )));
        }
        if self.recall.capacity == 0 {
            return Err(FieldError::Config("recall.capacity must be positive".into()));
        }
        if self.generation.fallback_reply.trim().is_empty() {
            return Err(FieldError::Config("generation.fallback_reply must be non-empty".into()));
        }
        let l = &self.loops;
        if l.ngram < 2 || l.window_tokens < l.ngram || l.saturation == 0 {
            return Err(FieldError::Config(
                "loops need ngram >= 2, window_tokens >= ngram and a positive saturation".into(),
            ));
        }
        if !(0.0..=1.0).contains(&l.quality_penalty) {
            return Err(FieldError::Config(format!(
                "loops.quality_penalty must be within [0, 1], got {}",
                l.quality_penalty
            )));
        }
        Ok(())
    }
}

/// Default on-disk location for a named field namespace.
pub fn default_db_path(namespace: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lexfield")
        .join(format!("{namespace}.sqlite3"))
}
