// ── Lexfield: Field Engine ──────────────────────────────────────────────────
//
// One `Field` per conversation context. It owns the committed state, the
// write guard and the stores, and exposes the two outward entry points
// (`ingest`, `generate`) plus the maintenance and memory operations.
//
// Concurrency:
//   - Committed state is an `Arc<FieldState>` behind a parking_lot RwLock.
//     Readers clone the Arc and work on that snapshot without blocking.
//     Components sit behind their own Arcs, so a mutation that races a
//     reader copies only the component it changes.
//   - Every mutation (ingest, decay, theme install, snapshot insert/touch,
//     trauma update, episode index) holds the tokio `guard` mutex, which is
//     FIFO so ingests apply in submission order. The new state is staged with
//     `Arc::make_mut` under a short write lock and becomes visible as a whole.
//   - Persistence is the only await point inside the guard. A failed batch
//     is coalesced into the pending queue and replayed with the next write
//     (counts are absolute, so the latest value per row is enough).
//   - Cancellation: a dropped `generate` future may already have committed a
//     recall touch. Side effects are at-least-once.
//
// Error policy: internal steps return `FieldResult`; `ingest` and `generate`
// log and degrade (or surface when `surface_errors` is set).

use crate::atoms::constants::{
    META_BOOTSTRAP_DONE, META_INGEST_COUNT, META_TRAUMA_STATE, PROMPT_LEN_NORM, REPLY_LEN_NORM,
};
use crate::atoms::error::{FieldError, FieldResult, IngestError};
use crate::atoms::field_types::{
    Episode, EpisodeFeatures, Expert, FieldConfig, FieldStats, PresencePulse,
};
use crate::atoms::traits::{EpisodeStore, LedgerStore, WriteOp};
use crate::engine::episodes::EpisodicMemory;
use crate::engine::generator::{echo_walk, generate_walk, WalkBias, WalkParams};
use crate::engine::ledger::decay::DecayScheduler;
use crate::engine::ledger::Ledger;
use crate::engine::loops::{LoopDetector, LoopReport};
use crate::engine::presence::{compute_pulse, EmotionMap};
use crate::engine::quality::{score_quality, should_save_snapshot, QualityReport};
use crate::engine::recall::{RecallHit, RecallQuery, SnapshotStore};
use crate::engine::router::route;
use crate::engine::store::{MemoryStore, PendingWrites, SqliteStore};
use crate::engine::themes::{activate, ActiveThemes, FlowScores, ThemeBuilder, ThemeFlow, ThemeSet};
use crate::engine::tokenizer::{format_tokens, tokenize};
use crate::engine::trauma::{TraumaState, TraumaTracker};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Everything readers see. Each component is copied on write, and only
/// when a reader still holds the previous version.
#[derive(Debug, Clone, Default)]
pub struct FieldState {
    pub ledger: Arc<Ledger>,
    pub themes: Arc<ThemeSet>,
    pub emotion: Arc<EmotionMap>,
    pub snapshots: Arc<SnapshotStore>,
    pub episodes: Arc<EpisodicMemory>,
    pub trauma: Arc<TraumaTracker>,
    pub ingest_count: u64,
}

/// Per-call generation options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateParams {
    /// Overrides `generation.max_tokens`.
    pub max_tokens: Option<usize>,
    /// Overrides the routed expert's temperature.
    pub temperature: Option<f32>,
    /// Overrides the routed expert's theme bias.
    pub semantic_weight: Option<f32>,
    /// One transition per prompt token, for diagnostics.
    pub echo: bool,
}

/// Optional subsystems resolved at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub episodic: bool,
}

/// Result of one full exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub text: String,
    pub pulse: PresencePulse,
    pub expert: Expert,
    pub quality: f32,
    pub recall_used: bool,
    pub misfire: bool,
    pub fallback: bool,
    pub snapshot_id: Option<i64>,
    pub episode_id: Option<i64>,
    /// How stuck recent replies are, 0..1.
    pub loop_score: f32,
    /// Reflection texts ingested after the reply; never part of `text`.
    pub reflections: Vec<String>,
}

/// Internal outcome of a successful generation.
#[derive(Debug, Clone)]
struct Generation {
    text: String,
    token_count: usize,
    pulse: PresencePulse,
    expert: Expert,
    temperature: f32,
    active: ActiveThemes,
    flow: FlowScores,
    recall: Option<RecallHit>,
}

/// State only the guard holder touches.
struct Writer {
    pending: PendingWrites,
    decay: DecayScheduler,
    since_rebuild: u64,
    next_episode_id: i64,
    episodes_since_prune: usize,
    bootstrapped: bool,
}

pub struct Field {
    config: FieldConfig,
    state: RwLock<Arc<FieldState>>,
    guard: tokio::sync::Mutex<Writer>,
    store: Arc<dyn LedgerStore>,
    episode_store: Option<Arc<dyn EpisodeStore>>,
    flow: Mutex<ThemeFlow>,
    loops: Mutex<LoopDetector>,
    rng: Mutex<StdRng>,
    pending_writes: AtomicUsize,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Field {
    // ═════════════════════════════════════════════════════════════════════
    // Construction
    // ═════════════════════════════════════════════════════════════════════

    /// Open a field with the stores implied by `config.db_path`: SQLite when
    /// set, an in-process store otherwise.
    pub async fn open(config: FieldConfig) -> FieldResult<Self> {
        match config.db_path.clone() {
            Some(path) => {
                let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path)).await??;
                let store = Arc::new(store);
                let episodes: Arc<dyn EpisodeStore> = store.clone();
                Self::with_stores(config, store, Some(episodes)).await
            }
            None => {
                let store = Arc::new(MemoryStore::new());
                let episodes: Arc<dyn EpisodeStore> = store.clone();
                Self::with_stores(config, store, Some(episodes)).await
            }
        }
    }

    /// Open a field over explicit stores. `episodes = None` runs without
    /// episodic memory.
    pub async fn with_stores(
        config: FieldConfig,
        store: Arc<dyn LedgerStore>,
        episodes: Option<Arc<dyn EpisodeStore>>,
    ) -> FieldResult<Self> {
        config.validate()?;
        info!("[field] Opening field over store '{}'", store.name());

        let ledger = Ledger::from_image(store.load_ledger().await?)?;
        let snapshots = SnapshotStore::from_snapshots(store.load_snapshots().await?);
        let ingest_count = store
            .get_meta(META_INGEST_COUNT)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let bootstrapped = store.get_meta(META_BOOTSTRAP_DONE).await?.is_some();
        let trauma_state = match store.get_meta(META_TRAUMA_STATE).await? {
            Some(raw) => serde_json::from_str::<TraumaState>(&raw).unwrap_or_else(|e| {
                warn!("[trauma] Discarding unreadable trauma state: {}", e);
                TraumaState::default()
            }),
            None => TraumaState::default(),
        };

        let capacity = config.episodes.capacity;
        let (episode_store, loaded) = match episodes {
            Some(es) => {
                let loaded = Self::load_episodes(es.as_ref(), capacity).await;
                match loaded {
                    Ok(loaded) => (Some(es), loaded),
                    Err(e) => {
                        warn!("[episodes] Episodic memory unavailable: {}", e);
                        (None, Vec::new())
                    }
                }
            }
            None => (None, Vec::new()),
        };
        // Ids come from the loaded rows, not the index: degenerate episodes
        // are stored but never indexed.
        let next_episode_id = loaded.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let memory = EpisodicMemory::from_episodes(loaded, capacity);

        let themes = ThemeBuilder::new(&config.themes).rebuild(&ledger, 1);
        info!(
            "[field] Loaded {} tokens, {} snapshots, {} episodes, {} themes",
            ledger.vocab_len(),
            snapshots.len(),
            memory.len(),
            themes.len()
        );

        let trauma = TraumaTracker::with_state(config.bootstrap_text.as_deref(), trauma_state);
        let state = FieldState {
            ledger: Arc::new(ledger),
            themes: Arc::new(themes),
            emotion: Arc::new(EmotionMap::new()),
            snapshots: Arc::new(snapshots),
            episodes: Arc::new(memory),
            trauma: Arc::new(trauma),
            ingest_count,
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let writer = Writer {
            pending: PendingWrites::default(),
            decay: DecayScheduler::new(config.decay.interval_ingests),
            since_rebuild: 0,
            next_episode_id,
            episodes_since_prune: 0,
            bootstrapped,
        };

        let field = Self {
            config,
            state: RwLock::new(Arc::new(state)),
            guard: tokio::sync::Mutex::new(writer),
            store,
            episode_store,
            flow: Mutex::new(ThemeFlow::default()),
            loops: Mutex::new(LoopDetector::new()),
            rng: Mutex::new(rng),
            pending_writes: AtomicUsize::new(0),
        };
        field.bootstrap().await?;
        Ok(field)
    }

    async fn load_episodes(store: &dyn EpisodeStore, capacity: usize) -> FieldResult<Vec<Episode>> {
        store.init_episodes().await?;
        store.load_episodes(capacity).await
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities { episodic: self.episode_store.is_some() }
    }

    /// Last committed state. Never blocks on writers beyond the Arc clone.
    pub fn snapshot(&self) -> Arc<FieldState> {
        self.state.read().clone()
    }

    // ═════════════════════════════════════════════════════════════════════
    // Commit + persistence (guard holder only)
    // ═════════════════════════════════════════════════════════════════════

    /// Stage a mutation and publish it atomically. Taking `&mut Writer`
    /// proves the caller holds the guard.
    fn commit<T>(&self, _writer: &mut Writer, f: impl FnOnce(&mut FieldState) -> T) -> T {
        let mut slot = self.state.write();
        f(Arc::make_mut(&mut slot))
    }

    /// Write `batch` together with anything still queued. On failure the
    /// rows stay queued, one entry per row, for the next write.
    async fn persist(&self, writer: &mut Writer, batch: Vec<WriteOp>) -> FieldResult<()> {
        if writer.pending.is_empty() {
            if batch.is_empty() {
                return Ok(());
            }
            return match self.store.apply(batch.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    writer.pending.extend(batch);
                    Err(self.queued(writer, e))
                }
            };
        }
        writer.pending.extend(batch);
        match self.store.apply(writer.pending.to_batch()).await {
            Ok(()) => {
                writer.pending.clear();
                self.pending_writes.store(0, Ordering::Relaxed);
                info!("[store] Queued writes replayed");
                Ok(())
            }
            Err(e) => Err(self.queued(writer, e)),
        }
    }

    fn queued(&self, writer: &Writer, e: FieldError) -> FieldError {
        let rows = writer.pending.len();
        warn!("[store] Write failed, {} rows queued for retry: {}", rows, e);
        self.pending_writes.store(rows, Ordering::Relaxed);
        FieldError::storage(e.to_string())
    }

    // ═════════════════════════════════════════════════════════════════════
    // Ingest
    // ═════════════════════════════════════════════════════════════════════

    /// Add text to the field. In-memory state always commits; persistence
    /// and scheduled-decay failures are logged and swallowed unless
    /// `surface_errors` is set.
    pub async fn ingest(&self, text: &str) -> Result<(), IngestError> {
        match self.ingest_inner(text).await {
            Ok(()) => Ok(()),
            Err(e) if self.config.surface_errors => Err(e),
            Err(e) => {
                warn!("[field] Ingest degraded: {}", e);
                Ok(())
            }
        }
    }

    async fn ingest_inner(&self, text: &str) -> Result<(), IngestError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(());
        }

        let mut writer = self.guard.lock().await;
        let (summary, batch) = self.commit(&mut writer, |st| {
            let (summary, mut batch) = Arc::make_mut(&mut st.ledger).ingest(&tokens, &self.config.ledger);
            Arc::make_mut(&mut st.emotion).absorb(text, &self.config.presence);
            st.ingest_count += 1;
            batch.push(WriteOp::SetMeta {
                key: META_INGEST_COUNT.into(),
                value: st.ingest_count.to_string(),
            });
            (summary, batch)
        });
        debug!(
            "[ledger] Ingested {} tokens ({} new, {} bigrams, {} co-occurrences touched)",
            summary.tokens, summary.new_tokens, summary.bigrams_touched, summary.cooccur_touched
        );
        let stored = self.persist(&mut writer, batch).await;

        let mut decayed = Ok(0);
        if writer.decay.tick() {
            decayed = self.decay_locked(&mut writer).await;
        }

        let interval = self.config.themes.rebuild_interval_ingests;
        writer.since_rebuild += 1;
        let rebuild_due = interval > 0 && writer.since_rebuild >= interval;
        if rebuild_due {
            writer.since_rebuild = 0;
        }
        drop(writer);

        if rebuild_due {
            if let Err(e) = self.rebuild_themes().await {
                warn!("[themes] Scheduled rebuild failed: {}", e);
            }
        }

        stored.map_err(IngestError::Storage)?;
        match decayed {
            Ok(_) => Ok(()),
            Err(e @ FieldError::Storage(_)) => Err(IngestError::Storage(e)),
            Err(e) => Err(IngestError::Decay(e)),
        }
    }

    // ═════════════════════════════════════════════════════════════════════
    // Decay + themes
    // ═════════════════════════════════════════════════════════════════════

    /// Run one decay pass now. Returns the number of evicted edges.
    ///
    /// A `Storage` error means the pass is already in memory and its rows
    /// are queued; a `Decay` error means the cycle was skipped.
    pub async fn decay(&self) -> FieldResult<usize> {
        let mut writer = self.guard.lock().await;
        writer.decay.reset();
        self.decay_locked(&mut writer).await
    }

    /// The pass runs on the blocking pool against a copy of the ledger and
    /// is installed whole. Persistence follows the same queue as ingest.
    async fn decay_locked(&self, writer: &mut Writer) -> FieldResult<usize> {
        let mut ledger = Arc::clone(&self.snapshot().ledger);
        let config = self.config.decay.clone();
        let (ledger, report, batch) = tokio::task::spawn_blocking(move || {
            let (report, batch) = Arc::make_mut(&mut ledger).decay(&config);
            (ledger, report, batch)
        })
        .await
        .map_err(|e| FieldError::Decay(format!("cycle skipped: {e}")))?;

        self.commit(writer, |st| st.ledger = ledger);
        if let Err(e) = self.persist(writer, batch).await {
            debug!("[decay] Pass kept in memory, evictions queued: {}", e);
            return Err(e);
        }
        Ok(report.evicted)
    }

    /// Recompute themes off the async executor and install them. Returns
    /// the number of themes.
    pub async fn rebuild_themes(&self) -> FieldResult<usize> {
        let snapshot = self.snapshot();
        let config = self.config.themes.clone();
        let generation = snapshot.themes.generation + 1;
        let themes = tokio::task::spawn_blocking(move || {
            ThemeBuilder::new(&config).rebuild(&snapshot.ledger, generation)
        })
        .await?;
        let count = themes.len();
        let mut writer = self.guard.lock().await;
        self.commit(&mut writer, |st| st.themes = Arc::new(themes));
        info!("[themes] Installed {} themes (generation {})", count, generation);
        Ok(count)
    }

    /// Ingest `bootstrap_text` once into an empty field. Returns whether it ran.
    pub async fn bootstrap(&self) -> FieldResult<bool> {
        let Some(text) = self.config.bootstrap_text.clone() else {
            return Ok(false);
        };
        {
            let writer = self.guard.lock().await;
            if writer.bootstrapped || !self.snapshot().ledger.is_empty() {
                return Ok(false);
            }
        }
        if let Err(e) = self.ingest_inner(&text).await {
            warn!("[field] Bootstrap ingest degraded: {}", e);
        }
        let mut writer = self.guard.lock().await;
        writer.bootstrapped = true;
        let batch = vec![WriteOp::SetMeta { key: META_BOOTSTRAP_DONE.into(), value: now().to_string() }];
        if let Err(e) = self.persist(&mut writer, batch).await {
            warn!("[field] Bootstrap marker not persisted: {}", e);
        }
        drop(writer);
        self.rebuild_themes().await?;
        info!("[field] Bootstrap text ingested");
        Ok(true)
    }

    // ═════════════════════════════════════════════════════════════════════
    // Generate
    // ═════════════════════════════════════════════════════════════════════

    /// Generate a reply. Always returns non-empty text: on any failure the
    /// configured fallback reply is returned.
    pub async fn generate(&self, prompt: &str, params: &GenerateParams) -> String {
        match self.generate_inner(prompt, params).await {
            Ok(g) => g.text,
            Err(e) => {
                debug!("[field] Generation fell back: {}", e);
                self.config.generation.fallback_reply.clone()
            }
        }
    }

    async fn generate_inner(&self, prompt: &str, params: &GenerateParams) -> FieldResult<Generation> {
        let state = self.snapshot();
        if state.ledger.is_empty() {
            return Err(FieldError::Generation("empty vocabulary".into()));
        }
        let cfg = &self.config;
        let at = now();
        let tokens = tokenize(prompt);
        let prompt_ids: Vec<_> = state.ledger.ids_of(&tokens).into_iter().flatten().collect();

        let pulse = compute_pulse(prompt, &state.ledger, &state.emotion, &cfg.presence);
        let active = activate(&prompt_ids, &state.themes, &cfg.themes);
        let flow = self.flow.lock().observe(&active, &state.themes);
        let trauma_level = state.trauma.level(at, &cfg.trauma);
        let expert = route(&pulse, active.active_count(), trauma_level, &cfg.router);
        let profile = expert.profile();
        let temperature = params.temperature.unwrap_or(profile.temperature).max(0.0);

        let mut rng = StdRng::seed_from_u64(self.rng.lock().gen());
        let walk = WalkParams {
            max_tokens: params.max_tokens.unwrap_or(cfg.generation.max_tokens),
            temperature,
            semantic_weight: params.semantic_weight.unwrap_or(profile.semantic_weight),
            prompt_gravity: cfg.generation.prompt_gravity,
            center_count: cfg.generation.center_count,
        };

        if params.echo {
            let out = echo_walk(&state.ledger, &tokens, &walk, &mut rng);
            let text = format_tokens(&out);
            if text.trim().is_empty() {
                return Err(FieldError::Generation("echo of an empty prompt".into()));
            }
            return Ok(Generation {
                text,
                token_count: out.len(),
                pulse,
                expert,
                temperature,
                active,
                flow,
                recall: None,
            });
        }

        let recall = state.snapshots.recall(
            &RecallQuery {
                prompt_tokens: &tokens,
                arousal: pulse.arousal,
                ledger: &state.ledger,
                themes: &state.themes,
                now: at,
            },
            &cfg.recall,
            &mut rng,
        );
        // Only the walk's inputs outlive the touch commit.
        let (ledger, themes) = (Arc::clone(&state.ledger), Arc::clone(&state.themes));
        drop(state);
        if let Some(hit) = &recall {
            self.touch_snapshot(hit.winner, at).await;
        }

        let bias = WalkBias {
            prompt: prompt_ids.iter().copied().collect::<HashSet<_>>(),
            themes: active.word_bias(&themes),
            recall: recall
                .as_ref()
                .map(|hit| hit.token_boosts(&ledger, cfg.recall.alpha))
                .unwrap_or_default(),
        };
        let ids = generate_walk(&ledger, &walk, &bias, &mut rng);
        let words: Vec<&str> = ids.iter().filter_map(|id| ledger.token(*id)).collect();
        let text = format_tokens(&words);
        if text.trim().is_empty() {
            return Err(FieldError::Generation("no usable start token".into()));
        }
        debug!(
            "[field] Generated {} tokens via {} (T={:.2}, pulse {:.2})",
            words.len(),
            expert.name(),
            temperature,
            pulse.pulse
        );
        Ok(Generation { text, token_count: words.len(), pulse, expert, temperature, active, flow, recall })
    }

    // ═════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═════════════════════════════════════════════════════════════════════

    async fn touch_snapshot(&self, id: i64, at: i64) {
        let mut writer = self.guard.lock().await;
        let op = self.commit(&mut writer, |st| Arc::make_mut(&mut st.snapshots).touch(id, at));
        if let Some(op) = op {
            if let Err(e) = self.persist(&mut writer, vec![op]).await {
                debug!("[recall] Touch of snapshot {} queued: {}", id, e);
            }
        }
    }

    /// Recall snapshot texts resonant with `prompt` and mark the winner used.
    pub async fn recall_snapshot(&self, prompt: &str) -> Option<Vec<String>> {
        let state = self.snapshot();
        let tokens = tokenize(prompt);
        let pulse = compute_pulse(prompt, &state.ledger, &state.emotion, &self.config.presence);
        let mut rng = StdRng::seed_from_u64(self.rng.lock().gen());
        let at = now();
        let hit = state.snapshots.recall(
            &RecallQuery {
                prompt_tokens: &tokens,
                arousal: pulse.arousal,
                ledger: &state.ledger,
                themes: &state.themes,
                now: at,
            },
            &self.config.recall,
            &mut rng,
        )?;
        drop(state);
        self.touch_snapshot(hit.winner, at).await;
        Some(hit.texts().into_iter().map(str::to_string).collect())
    }

    /// Store a reply for later recall. The snapshot is kept in memory even
    /// when the durable write fails.
    pub async fn save_snapshot(&self, text: &str, quality: f32, emotional: f32) -> FieldResult<i64> {
        let mut writer = self.guard.lock().await;
        let capacity = self.config.recall.capacity;
        let (snapshot, batch) = self.commit(&mut writer, |st| {
            Arc::make_mut(&mut st.snapshots).insert(text, quality, emotional, now(), capacity)
        });
        self.persist(&mut writer, batch).await?;
        debug!("[recall] Saved snapshot {} (quality {:.2})", snapshot.id, snapshot.quality);
        Ok(snapshot.id)
    }

    // ═════════════════════════════════════════════════════════════════════
    // Episodes
    // ═════════════════════════════════════════════════════════════════════

    /// Record an exchange. Returns the episode id, or `None` when episodic
    /// memory is unavailable.
    pub async fn record_episode(
        &self,
        prompt: &str,
        reply: &str,
        features: EpisodeFeatures,
        expert: Expert,
        quality: f32,
    ) -> Option<i64> {
        let store = self.episode_store.as_ref()?;
        let mut writer = self.guard.lock().await;
        let episode = Episode {
            id: writer.next_episode_id,
            created_at: now(),
            prompt: prompt.to_string(),
            reply: reply.to_string(),
            features: features.sanitized(),
            expert,
            quality: quality.clamp(0.0, 1.0),
        };
        writer.next_episode_id += 1;
        let id = episode.id;
        self.commit(&mut writer, |st| Arc::make_mut(&mut st.episodes).record(episode.clone()));

        if let Err(e) = store.append_episode(episode).await {
            warn!("[episodes] Episode {} kept in memory only: {}", id, e);
            return Some(id);
        }
        writer.episodes_since_prune += 1;
        let capacity = self.config.episodes.capacity;
        if writer.episodes_since_prune >= capacity.max(1) {
            writer.episodes_since_prune = 0;
            match store.prune_episodes(capacity).await {
                Ok(n) if n > 0 => info!("[episodes] Pruned {} old episodes", n),
                Ok(_) => {}
                Err(e) => warn!("[episodes] Prune failed: {}", e),
            }
        }
        Some(id)
    }

    /// Episodes most similar to `vector`, best first. Empty when episodic
    /// memory is unavailable or the vector is malformed.
    pub fn query_similar(&self, vector: &[f32], top_k: Option<usize>, min_quality: f32) -> Vec<(Episode, f32)> {
        if self.episode_store.is_none() {
            return Vec::new();
        }
        let k = top_k.unwrap_or(self.config.episodes.default_top_k);
        self.snapshot().episodes.query_similar(vector, k, min_quality)
    }

    // ═════════════════════════════════════════════════════════════════════
    // Exchange loop
    // ═════════════════════════════════════════════════════════════════════

    /// ingest(prompt) → generate → ingest(reply) → loops → trauma → episode
    /// → snapshot → reflection (when enabled).
    pub async fn exchange(&self, prompt: &str, params: &GenerateParams) -> Reply {
        if let Err(e) = self.ingest(prompt).await {
            warn!("[field] Prompt ingest failed: {}", e);
        }

        let generation = match self.generate_inner(prompt, params).await {
            Ok(g) => g,
            Err(e) => {
                debug!("[field] Exchange fell back: {}", e);
                return Reply {
                    text: self.config.generation.fallback_reply.clone(),
                    pulse: PresencePulse::default(),
                    expert: Expert::Structural,
                    quality: 0.0,
                    recall_used: false,
                    misfire: false,
                    fallback: true,
                    snapshot_id: None,
                    episode_id: None,
                    loop_score: 0.0,
                    reflections: Vec::new(),
                };
            }
        };

        if !params.echo {
            if let Err(e) = self.ingest(&generation.text).await {
                warn!("[field] Reply ingest failed: {}", e);
            }
        }

        let loops = if params.echo {
            LoopReport::default()
        } else {
            self.loops.lock().observe(&tokenize(&generation.text), &self.config.loops)
        };
        if loops.repeated_ngrams > 0 {
            debug!("[loops] {} repeated n-grams (score {:.2})", loops.repeated_ngrams, loops.loop_score);
        }
        let quality = score_quality(prompt, &generation.text, &self.snapshot().ledger)
            .with_loop_score(loops.loop_score, self.config.loops.quality_penalty);
        let trauma_level = self.observe_trauma(prompt, &generation).await;
        let features = self.episode_features(prompt, &generation, &quality, trauma_level, params.echo);
        let episode_id = self
            .record_episode(prompt, &generation.text, features, generation.expert, quality.score)
            .await;

        let mut snapshot_id = None;
        if !params.echo && should_save_snapshot(&quality, &generation.text, &self.config.recall) {
            match self.save_snapshot(&generation.text, quality.score, generation.pulse.arousal).await {
                Ok(id) => snapshot_id = Some(id),
                Err(e) => warn!("[recall] Snapshot kept in memory only: {}", e),
            }
        }

        let reflections = if self.config.reflection.enabled && !params.echo {
            self.reflect(prompt, &generation.text).await
        } else {
            Vec::new()
        };

        Reply {
            recall_used: generation.recall.is_some(),
            misfire: generation.recall.as_ref().is_some_and(|h| h.misfire),
            text: generation.text,
            pulse: generation.pulse,
            expert: generation.expert,
            quality: quality.score,
            fallback: false,
            snapshot_id,
            episode_id,
            loop_score: quality.loop_score,
            reflections,
        }
    }

    /// Run the configured reflection rings over a finished exchange. Each
    /// ring generates from the exchange and its text is ingested back; a
    /// ring that cannot generate is skipped.
    pub async fn reflect(&self, prompt: &str, reply: &str) -> Vec<String> {
        let (prompt, reply) = (prompt.trim(), reply.trim());
        let both = format!("{prompt} {reply}");
        let both = both.trim();
        if both.is_empty() {
            return Vec::new();
        }

        let mut thoughts = Vec::new();
        for (i, ring) in self.config.reflection.rings.iter().enumerate() {
            let seed = if ring.reply_only && !reply.is_empty() { reply } else { both };
            let params = GenerateParams {
                max_tokens: Some(ring.max_tokens),
                temperature: Some(ring.temperature),
                semantic_weight: Some(ring.semantic_weight),
                echo: false,
            };
            match self.generate_inner(seed, &params).await {
                Ok(g) => {
                    if let Err(e) = self.ingest(&g.text).await {
                        warn!("[reflect] Ring {} ingest failed: {}", i, e);
                    }
                    thoughts.push(g.text);
                }
                Err(e) => debug!("[reflect] Ring {} skipped: {}", i, e),
            }
        }
        debug!("[reflect] {} of {} rings ingested", thoughts.len(), self.config.reflection.rings.len());
        thoughts
    }

    async fn observe_trauma(&self, prompt: &str, generation: &Generation) -> f32 {
        let at = now();
        let mut writer = self.guard.lock().await;
        let cfg = &self.config.trauma;
        let (level, json) = self.commit(&mut writer, |st| {
            Arc::make_mut(&mut st.trauma).observe(prompt, &generation.text, &generation.pulse, at, cfg);
            (st.trauma.level(at, cfg), serde_json::to_string(st.trauma.state()))
        });
        match json {
            Ok(value) => {
                let op = WriteOp::SetMeta { key: META_TRAUMA_STATE.into(), value };
                if let Err(e) = self.persist(&mut writer, vec![op]).await {
                    debug!("[trauma] State write queued: {}", e);
                }
            }
            Err(e) => error!("[trauma] Could not serialise state: {}", e),
        }
        level
    }

    fn episode_features(
        &self,
        prompt: &str,
        g: &Generation,
        quality: &QualityReport,
        trauma_level: f32,
        echo: bool,
    ) -> EpisodeFeatures {
        let profile = g.expert.profile();
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        EpisodeFeatures {
            entropy: g.pulse.entropy,
            novelty: g.pulse.novelty,
            arousal: g.pulse.arousal,
            pulse: g.pulse.pulse,
            trauma_level,
            active_themes: g.active.active_ratio,
            emerging_score: g.flow.emerging,
            fading_score: g.flow.fading,
            reply_len_norm: (g.token_count as f32 / REPLY_LEN_NORM).min(1.0),
            unique_ratio: quality.unique_ratio,
            expert_temp: g.temperature,
            expert_semantic: profile.semantic_weight,
            recall_used: flag(g.recall.is_some()),
            misfire: flag(g.recall.as_ref().is_some_and(|h| h.misfire)),
            prompt_len_norm: (tokenize(prompt).len() as f32 / PROMPT_LEN_NORM).min(1.0),
            echo: flag(echo),
        }
    }

    // ═════════════════════════════════════════════════════════════════════
    // Stats + maintenance
    // ═════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> FieldStats {
        let st = self.snapshot();
        FieldStats {
            vocab: st.ledger.vocab_len(),
            bigrams: st.ledger.bigram_edges(),
            trigrams: st.ledger.trigram_edges(),
            cooccurrences: st.ledger.cooccur_edges(),
            themes: st.themes.len(),
            snapshots: st.snapshots.len(),
            episodes: st.episodes.len(),
            ingest_count: st.ingest_count,
            pending_writes: self.pending_writes.load(Ordering::Relaxed),
            episodic_available: self.episode_store.is_some(),
        }
    }

    /// Run decay and a theme rebuild every `interval` until the field is
    /// dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Field> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(field) = weak.upgrade() else {
                    debug!("[field] Maintenance stopped: field dropped");
                    break;
                };
                match field.decay().await {
                    Ok(evicted) => debug!("[decay] Maintenance pass evicted {} edges", evicted),
                    Err(e) => warn!("[decay] Maintenance pass skipped: {}", e),
                }
                if let Err(e) = field.rebuild_themes().await {
                    warn!("[themes] Maintenance rebuild failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::field_types::{DecayConfig, ReflectionConfig, ThemeConfig};

    fn config() -> FieldConfig {
        FieldConfig {
            seed: Some(42),
            decay: DecayConfig { interval_ingests: 0, ..Default::default() },
            themes: ThemeConfig { rebuild_interval_ingests: 0, ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_field_falls_back() {
        let field = Field::open(config()).await.unwrap();
        assert_eq!(field.generate("hello", &GenerateParams::default()).await, "...");
    }

    #[tokio::test]
    async fn ingest_counts_bigrams() {
        let field = Field::open(config()).await.unwrap();
        field.ingest("the cat sat on the mat. the cat ran.").await.unwrap();
        assert_eq!(field.snapshot().ledger.bigram_count("the", "cat"), 2);
        assert_eq!(field.stats().ingest_count, 1);
    }

    #[tokio::test]
    async fn storage_failure_is_swallowed_then_retried() {
        let store = Arc::new(MemoryStore::new());
        let field = Field::with_stores(config(), store.clone(), None).await.unwrap();
        store.set_fail_writes(true);
        field.ingest("alpha beta gamma").await.unwrap();
        assert!(field.stats().pending_writes > 0);
        assert_eq!(field.snapshot().ledger.bigram_count("alpha", "beta"), 1);

        store.set_fail_writes(false);
        field.ingest("gamma delta").await.unwrap();
        assert_eq!(field.stats().pending_writes, 0);
        let image = store.load_ledger().await.unwrap();
        let rebuilt = Ledger::from_image(image).unwrap();
        assert_eq!(rebuilt.bigram_count("alpha", "beta"), 1);
        assert_eq!(rebuilt.bigram_count("gamma", "delta"), 1);
    }

    #[tokio::test]
    async fn surfaced_errors_reach_the_caller() {
        let store = Arc::new(MemoryStore::new());
        let cfg = FieldConfig { surface_errors: true, ..config() };
        let field = Field::with_stores(cfg, store.clone(), None).await.unwrap();
        store.set_fail_writes(true);
        let err = field.ingest("alpha beta").await.unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
    }

    #[tokio::test]
    async fn decay_continues_in_memory_during_outage() {
        let store = Arc::new(MemoryStore::new());
        let field = Field::with_stores(config(), store.clone(), None).await.unwrap();
        field.ingest("lonely pair").await.unwrap();
        store.set_fail_writes(true);
        // novelty bonus start of 2: one pass to 1, the next evicts
        assert!(matches!(field.decay().await, Err(FieldError::Storage(_))));
        assert_eq!(field.snapshot().ledger.cooccur_count("lonely", "pair"), 1);
        assert!(matches!(field.decay().await, Err(FieldError::Storage(_))));
        assert_eq!(field.snapshot().ledger.cooccur_count("lonely", "pair"), 0);

        store.set_fail_writes(false);
        assert_eq!(field.decay().await.unwrap(), 0);
        assert_eq!(field.stats().pending_writes, 0);
        let rebuilt = Ledger::from_image(store.load_ledger().await.unwrap()).unwrap();
        assert_eq!(rebuilt.cooccur_count("lonely", "pair"), 0);
        assert_eq!(rebuilt.bigram_count("lonely", "pair"), 1);
    }

    #[tokio::test]
    async fn scheduled_decay_runs_while_writes_fail() {
        let store = Arc::new(MemoryStore::new());
        let cfg = FieldConfig { decay: DecayConfig { interval_ingests: 1, ..Default::default() }, ..config() };
        let field = Field::with_stores(cfg, store.clone(), None).await.unwrap();
        field.ingest("lonely pair").await.unwrap();
        store.set_fail_writes(true);
        for _ in 0..20 {
            field.ingest("unrelated chatter").await.unwrap();
        }
        assert_eq!(field.snapshot().ledger.cooccur_count("lonely", "pair"), 0);
    }

    #[tokio::test]
    async fn pending_queue_stays_bounded_during_outage() {
        let store = Arc::new(MemoryStore::new());
        let field = Field::with_stores(config(), store.clone(), None).await.unwrap();
        store.set_fail_writes(true);
        for _ in 0..10 {
            field.ingest("alpha beta gamma").await.unwrap();
        }
        let after_ten = field.stats().pending_writes;
        assert!(after_ten > 0);
        for _ in 0..100 {
            field.ingest("alpha beta gamma").await.unwrap();
        }
        assert_eq!(field.stats().pending_writes, after_ten);

        store.set_fail_writes(false);
        field.ingest("delta").await.unwrap();
        assert_eq!(field.stats().pending_writes, 0);
        let rebuilt = Ledger::from_image(store.load_ledger().await.unwrap()).unwrap();
        assert_eq!(rebuilt.bigram_count("alpha", "beta"), 110);
        assert_eq!(store.get_meta(META_INGEST_COUNT).await.unwrap().as_deref(), Some("111"));
    }

    #[tokio::test]
    async fn recall_touch_copies_only_the_snapshot_store() {
        let field = Field::open(config()).await.unwrap();
        field.ingest("the tide comes in slowly").await.unwrap();
        field.save_snapshot("the tide comes in", 0.9, 0.2).await.unwrap();
        let before = field.snapshot();
        assert!(field.recall_snapshot("the tide").await.is_some());
        let after = field.snapshot();
        assert!(Arc::ptr_eq(&before.ledger, &after.ledger));
        assert!(Arc::ptr_eq(&before.themes, &after.themes));
        assert!(!Arc::ptr_eq(&before.snapshots, &after.snapshots));
        assert_eq!(before.snapshots.snapshots().next().map(|s| s.use_count), Some(0));
        assert_eq!(after.snapshots.snapshots().next().map(|s| s.use_count), Some(1));
    }

    #[tokio::test]
    async fn ingest_under_a_reader_leaves_other_components_shared() {
        let field = Field::open(config()).await.unwrap();
        field.save_snapshot("kept as is", 0.9, 0.2).await.unwrap();
        let before = field.snapshot();
        field.ingest("new words land").await.unwrap();
        let after = field.snapshot();
        assert!(Arc::ptr_eq(&before.snapshots, &after.snapshots));
        assert!(Arc::ptr_eq(&before.episodes, &after.episodes));
        assert!(before.ledger.is_empty());
        assert_eq!(after.ledger.vocab_len(), 3);
    }

    #[tokio::test]
    async fn episodic_memory_disabled_when_schema_fails() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_episode_init(true);
        let episodes: Arc<dyn EpisodeStore> = store.clone();
        let field = Field::with_stores(config(), store.clone(), Some(episodes)).await.unwrap();
        assert!(!field.capabilities().episodic);
        field.ingest("still works fine").await.unwrap();
        let reply = field.exchange("still works", &GenerateParams::default()).await;
        assert!(!reply.text.is_empty());
        assert_eq!(reply.episode_id, None);
        assert!(field.query_similar(&[1.0; 21], Some(3), 0.0).is_empty());
    }

    #[tokio::test]
    async fn bootstrap_runs_once() {
        let store = Arc::new(MemoryStore::new());
        let cfg = FieldConfig { bootstrap_text: Some("i am a quiet field of words.".into()), ..config() };
        let field = Field::with_stores(cfg.clone(), store.clone(), None).await.unwrap();
        assert!(field.snapshot().ledger.id("quiet").is_some());
        assert!(!field.bootstrap().await.unwrap());
        let count = field.stats().ingest_count;

        let reopened = Field::with_stores(cfg, store, None).await.unwrap();
        assert_eq!(reopened.stats().ingest_count, count);
    }

    #[tokio::test]
    async fn exchange_records_episode_and_reply() {
        let field = Field::open(config()).await.unwrap();
        for _ in 0..3 {
            field.ingest("the river runs to the sea. the sea is wide.").await.unwrap();
        }
        let reply = field.exchange("where does the river go?", &GenerateParams::default()).await;
        assert!(!reply.fallback);
        assert!(!reply.text.is_empty());
        assert_eq!(reply.episode_id, Some(1));
        assert_eq!(field.stats().episodes, 1);
    }

    #[tokio::test]
    async fn echo_mode_maps_token_by_token() {
        let field = Field::open(config()).await.unwrap();
        field.ingest("the cat sat").await.unwrap();
        let params = GenerateParams { echo: true, ..Default::default() };
        assert_eq!(field.generate("the cat", &params).await, "cat sat");
    }

    #[tokio::test]
    async fn reflection_rings_feed_the_field() {
        let cfg = FieldConfig {
            reflection: ReflectionConfig { enabled: true, ..Default::default() },
            ..config()
        };
        let field = Field::open(cfg).await.unwrap();
        field.ingest("the river runs to the sea. the sea is wide and the river is long.").await.unwrap();
        let reply = field.exchange("where does the river run?", &GenerateParams::default()).await;
        assert!(!reply.fallback);
        assert_eq!(reply.reflections.len(), 3);
        assert!(reply.reflections.iter().all(|t| !t.is_empty()));
        // prompt, reply and three rings
        assert_eq!(field.stats().ingest_count, 1 + 2 + 3);
    }

    #[tokio::test]
    async fn reflection_is_off_by_default() {
        let field = Field::open(config()).await.unwrap();
        field.ingest("the river runs to the sea").await.unwrap();
        let reply = field.exchange("the river", &GenerateParams::default()).await;
        assert!(reply.reflections.is_empty());
        assert_eq!(field.stats().ingest_count, 3);
    }

    #[tokio::test]
    async fn repeating_replies_raise_the_loop_score() {
        let field = Field::open(config()).await.unwrap();
        for _ in 0..5 {
            field.ingest("round and round the wheel goes .").await.unwrap();
        }
        let params = GenerateParams { temperature: Some(0.0), ..Default::default() };
        let mut last = 0.0;
        for _ in 0..6 {
            let reply = field.exchange("tell me", &params).await;
            assert!(reply.loop_score >= last);
            last = reply.loop_score;
        }
        assert!(last > 0.0);
    }

    #[tokio::test]
    async fn maintenance_task_stops_with_field() {
        let field = Arc::new(Field::open(config()).await.unwrap());
        field.ingest("maintenance keeps the field tidy").await.unwrap();
        let handle = field.spawn_maintenance(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        // at least one decay pass ran (fresh pairs start at 2)
        assert!(field.snapshot().ledger.cooccur_count("maintenance", "keeps") < 2);
        drop(field);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
