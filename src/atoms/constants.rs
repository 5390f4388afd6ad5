// ── Lexfield Atoms: Constants ──────────────────────────────────────────────
// Named constants shared across layers. Tunable heuristics live in
// `FieldConfig`; what remains here are identifiers and structural limits.

// ── Meta keys ─────────────────────────────────────────────────────────────
// Stored in the `meta(key, value)` table. Treat as stable identifiers:
// renaming one orphans the value already persisted under the old key.
pub(crate) const META_BOOTSTRAP_DONE: &str = "bootstrap_done";
pub(crate) const META_INGEST_COUNT: &str = "ingest_count";
pub(crate) const META_TRAUMA_STATE: &str = "trauma_state";

// ── Episode features ──────────────────────────────────────────────────────
/// Number of persisted scalar features per episode.
pub const EPISODE_SCALAR_FEATURES: usize = 16;
/// Number of expert variants (one-hot width).
pub const EXPERT_COUNT: usize = 5;
/// Full feature-vector width: scalars followed by the expert one-hot.
pub const FEATURE_DIM: usize = EPISODE_SCALAR_FEATURES + EXPERT_COUNT;

// ── Tokens ────────────────────────────────────────────────────────────────
/// Tokens that end a sentence; the generator stops after emitting one.
pub const SENTENCE_TERMINALS: &[&str] = &[".", "!", "?"];
/// Punctuation tokens. Never used as generation centers; all but the dashes
/// are glued to the previous word when formatting.
pub const PUNCTUATION: &[&str] = &[".", ",", "!", "?", ";", ":", "—", "-"];

// ── Reply shape ───────────────────────────────────────────────────────────
/// Reply length (tokens) at which the length feature saturates to 1.0.
pub(crate) const REPLY_LEN_NORM: f32 = 64.0;
/// Prompt length (tokens) at which the prompt-length feature saturates.
pub(crate) const PROMPT_LEN_NORM: f32 = 32.0;

/// Returns true for tokens in `PUNCTUATION`.
pub fn is_punctuation(token: &str) -> bool {
    PUNCTUATION.contains(&token)
}

/// Returns true for sentence-terminal tokens.
pub fn is_terminal(token: &str) -> bool {
    SENTENCE_TERMINALS.contains(&token)
}
