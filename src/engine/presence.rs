// ── Field: Presence Metrics ─────────────────────────────────────────────────
//
// Per-prompt signals that drive expert routing:
//
//   novelty  fraction of prompt trigrams the ledger has never seen
//   arousal  emphasis heuristics (caps, `!`, `?`, repetition), each decaying
//            with distance from the end of the prompt, plus the learned
//            per-token emotion map
//   entropy  Shannon entropy (natural log) of the continuation distribution
//            after the prompt's tail, normalised by ln(k) into [0, 1]
//   pulse    novelty_weight·novelty + arousal_weight·arousal + entropy_weight·entropy
//
// All four are in [0, 1]. Nothing here mutates the ledger; the emotion map
// is updated by the ingest path through `EmotionMap::absorb`.

use crate::atoms::constants::is_punctuation;
use crate::atoms::field_types::{PresenceConfig, PresencePulse};
use crate::engine::ledger::{Ledger, Row};
use crate::engine::tokenizer::{tokenize, tokenize_raw};
use std::collections::HashMap;

/// Cap for a single token's accumulated charge.
const MAX_CHARGE: f32 = 5.0;
/// Retention of old charge on each new observation.
const CHARGE_RETENTION: f32 = 0.95;

// ═════════════════════════════════════════════════════════════════════════════
// Emotion Map
// ═════════════════════════════════════════════════════════════════════════════

/// Learned emotional charge per (lowercased) token.
///
/// Tokens that keep showing up shouted, next to `!`, or repeated in quick
/// succession accumulate charge. The map is a derived cache of ingested text
/// and is rebuilt from scratch as new text arrives after a restart.
#[derive(Debug, Clone, Default)]
pub struct EmotionMap {
    charge: HashMap<String, f32>,
}

impl EmotionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.charge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charge.is_empty()
    }

    /// Accumulate charge from one ingested text (raw casing).
    pub fn absorb(&mut self, text: &str, config: &PresenceConfig) {
        let raw = tokenize_raw(text);
        for (i, tok) in raw.iter().enumerate() {
            if is_punctuation(tok) {
                continue;
            }
            let mut hit = 0.0;
            if is_shouted(tok) {
                hit += 1.0;
            }
            if raw[i + 1..].iter().take(3).any(|t| *t == "!") {
                hit += 0.5;
            }
            let lower = tok.to_lowercase();
            if is_repeated(&raw, i, &lower, config.repetition_window) {
                hit += 0.5;
            }
            if hit > 0.0 {
                let slot = self.charge.entry(lower).or_insert(0.0);
                *slot = (*slot * CHARGE_RETENTION + hit).min(MAX_CHARGE);
            }
        }
    }

    /// Charge of a token in [0, 1).
    pub fn charge(&self, token: &str) -> f32 {
        self.charge.get(token).map(|c| 1.0 - (-c).exp()).unwrap_or(0.0)
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Metrics
// ═════════════════════════════════════════════════════════════════════════════

/// Full presence pulse for a prompt.
pub fn compute_pulse(
    prompt: &str,
    ledger: &Ledger,
    emotion: &EmotionMap,
    config: &PresenceConfig,
) -> PresencePulse {
    let tokens = tokenize(prompt);
    let novelty = compute_novelty(&tokens, ledger);
    let arousal = compute_arousal(prompt, emotion, config);
    let entropy = compute_entropy(&tokens, ledger);
    let pulse = (config.novelty_weight * novelty
        + config.arousal_weight * arousal
        + config.entropy_weight * entropy)
        .clamp(0.0, 1.0);
    PresencePulse { novelty, arousal, entropy, pulse }
}

/// Fraction of prompt trigrams absent from the ledger.
///
/// Prompts shorter than three tokens have no trigrams; for those the score
/// is the fraction of tokens missing from the vocabulary. Empty prompts
/// score 0.
pub fn compute_novelty<S: AsRef<str>>(tokens: &[S], ledger: &Ledger) -> f32 {
    if tokens.is_empty() {
        return 0.0;
    }
    let ids = ledger.ids_of(tokens);
    if ids.len() < 3 {
        let unknown = ids.iter().filter(|id| id.is_none()).count();
        return unknown as f32 / ids.len() as f32;
    }
    let total = ids.len() - 2;
    let missing = ids
        .windows(3)
        .filter(|w| match (w[0], w[1], w[2]) {
            (Some(a), Some(b), Some(c)) => ledger.trigram_count_id(a, b, c) == 0,
            _ => true,
        })
        .count();
    missing as f32 / total as f32
}

/// Emphasis heuristic over the raw prompt plus the emotion map.
pub fn compute_arousal(prompt: &str, emotion: &EmotionMap, config: &PresenceConfig) -> f32 {
    let raw = tokenize_raw(prompt);
    if raw.is_empty() {
        return 0.0;
    }
    let n = raw.len();
    let (mut caps, mut bang, mut question, mut repeat) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    let mut charge_sum = 0.0f32;
    let mut words = 0usize;

    for (i, tok) in raw.iter().enumerate() {
        let falloff = config.arousal_distance_decay.powi((n - 1 - i) as i32);
        match *tok {
            "!" => bang += falloff,
            "?" => question += falloff,
            t if is_punctuation(t) => {}
            t => {
                words += 1;
                let lower = t.to_lowercase();
                charge_sum += emotion.charge(&lower);
                if is_shouted(t) {
                    caps += falloff;
                }
                if is_repeated(&raw, i, &lower, config.repetition_window) {
                    repeat += falloff;
                }
            }
        }
    }

    let heuristic = config.caps_weight * caps.min(1.0)
        + config.exclamation_weight * bang.min(1.0)
        + config.question_weight * question.min(1.0)
        + config.repetition_weight * repeat.min(1.0);
    let learned = if words > 0 { charge_sum / words as f32 } else { 0.0 };
    (heuristic + config.emotion_map_weight * learned).clamp(0.0, 1.0)
}

/// Normalised continuation entropy after the prompt tail.
///
/// Uses the trigram row for the last two tokens when it exists, else the
/// bigram row of the last token. No continuation at all means maximal
/// uncertainty (1.0); a single possible continuation is 0.
pub fn compute_entropy<S: AsRef<str>>(tokens: &[S], ledger: &Ledger) -> f32 {
    let ids = ledger.ids_of(tokens);
    let tail_pair = match ids.as_slice() {
        [.., Some(a), Some(b)] => ledger.continuations(*a, *b),
        _ => None,
    };
    let row = tail_pair.or_else(|| match ids.last() {
        Some(Some(last)) => ledger.successors(*last),
        _ => None,
    });
    row.map(normalized_entropy).unwrap_or(1.0)
}

/// Shannon entropy (nats) of a count row divided by ln(k).
pub fn normalized_entropy(row: &Row) -> f32 {
    let k = row.values().filter(|c| **c > 0).count();
    if k <= 1 {
        return 0.0;
    }
    let total: u64 = row.values().sum();
    let total = total as f64;
    let h: f64 = row
        .values()
        .filter(|c| **c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.ln()
        })
        .sum();
    ((h / (k as f64).ln()) as f32).clamp(0.0, 1.0)
}

fn is_shouted(tok: &str) -> bool {
    tok.chars().filter(|c| c.is_alphabetic()).count() >= 2
        && tok.chars().all(|c| !c.is_alphabetic() || c.is_uppercase())
}

fn is_repeated(raw: &[&str], i: usize, lower: &str, window: usize) -> bool {
    raw[i.saturating_sub(window)..i]
        .iter()
        .any(|prev| !is_punctuation(prev) && prev.to_lowercase() == lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::field_types::LedgerConfig;

    fn ledger(text: &str) -> Ledger {
        let mut l = Ledger::new();
        l.ingest(&tokenize(text), &LedgerConfig::default());
        l
    }

    #[test]
    fn novelty_counts_unseen_trigrams() {
        let l = ledger("the cat sat on the mat");
        assert_eq!(compute_novelty(&tokenize("the cat sat"), &l), 0.0);
        assert_eq!(compute_novelty(&tokenize("the dog sat"), &l), 1.0);
        // "the cat sat" seen, "cat sat down" not
        assert_eq!(compute_novelty(&tokenize("the cat sat down"), &l), 0.5);
    }

    #[test]
    fn short_prompt_novelty_uses_vocabulary() {
        let l = ledger("hello there");
        assert_eq!(compute_novelty(&tokenize("hello"), &l), 0.0);
        assert_eq!(compute_novelty(&tokenize("hello stranger"), &l), 0.5);
        assert_eq!(compute_novelty::<String>(&[], &l), 0.0);
    }

    #[test]
    fn entropy_is_zero_for_single_continuation_and_one_for_none() {
        let l = ledger("a b c");
        assert_eq!(compute_entropy(&tokenize("a b"), &l), 0.0);
        assert_eq!(compute_entropy(&tokenize("zzz"), &l), 1.0);
    }

    #[test]
    fn uniform_continuations_have_full_entropy() {
        let l = ledger("x y a . x y b . x y c");
        let e = compute_entropy(&tokenize("x y"), &l);
        assert!((e - 1.0).abs() < 1e-5, "entropy {e}");
    }

    #[test]
    fn emphasis_raises_arousal() {
        let cfg = PresenceConfig::default();
        let map = EmotionMap::new();
        let calm = compute_arousal("i went to the shop", &map, &cfg);
        let loud = compute_arousal("I went to the SHOP!!", &map, &cfg);
        assert_eq!(calm, 0.0);
        assert!(loud > 0.5, "loud arousal {loud}");
        assert!(loud <= 1.0);
    }

    #[test]
    fn emphasis_decays_with_distance_from_end() {
        let cfg = PresenceConfig::default();
        let map = EmotionMap::new();
        let near = compute_arousal("we should talk NOW", &map, &cfg);
        let far = compute_arousal("NOW we should talk about this later", &map, &cfg);
        assert!(near > far);
    }

    #[test]
    fn emotion_map_feeds_arousal() {
        let cfg = PresenceConfig::default();
        let mut map = EmotionMap::new();
        for _ in 0..5 {
            map.absorb("FIRE! fire fire!", &cfg);
        }
        assert!(map.charge("fire") > 0.9);
        let with = compute_arousal("the fire", &map, &cfg);
        let without = compute_arousal("the fire", &EmotionMap::new(), &cfg);
        assert!(with > without);
    }

    #[test]
    fn pulse_is_convex_combination() {
        let cfg = PresenceConfig::default();
        let l = ledger("the cat sat on the mat");
        let p = compute_pulse("the cat sat", &l, &EmotionMap::new(), &cfg);
        let expected = 0.3 * p.novelty + 0.4 * p.arousal + 0.3 * p.entropy;
        assert!((p.pulse - expected).abs() < 1e-6);
        for v in [p.novelty, p.arousal, p.entropy, p.pulse] {
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
