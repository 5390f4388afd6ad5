// ── Field: Expert Router ────────────────────────────────────────────────────
//
// Deterministic decision table. Checked in fixed priority order:
//
//   1. wounded     trauma_level > trauma_threshold
//   2. creative    novelty > novelty_high
//   3. semantic    more than one theme active above the minimum score
//   4. precise     entropy < entropy_low
//   5. structural  otherwise
//
// There is no randomness here; the same inputs always pick the same expert.

use crate::atoms::field_types::{Expert, PresencePulse, RouterConfig};

/// Pick the expert for one generation call. `active_themes` counts themes
/// whose activation already cleared the minimum score.
pub fn route(
    pulse: &PresencePulse,
    active_themes: usize,
    trauma_level: f32,
    config: &RouterConfig,
) -> Expert {
    if trauma_level > config.trauma_threshold {
        Expert::Wounded
    } else if pulse.novelty > config.novelty_high {
        Expert::Creative
    } else if active_themes > 1 {
        Expert::Semantic
    } else if pulse.entropy < config.entropy_low {
        Expert::Precise
    } else {
        Expert::Structural
    }
}
