// ── Field: Reply Quality ────────────────────────────────────────────────────
//
// Self-assessment of a generated reply, in [0, 1]:
//
//   0.3 · unique-token ratio
//   0.3 · length adequacy (ramps up to MIN_WORDS, flat to MAX_WORDS, then tapers)
//   0.2 · (1 − share of reply trigrams copied verbatim from the prompt)
//   0.2 · share of reply trigrams the ledger has seen
//
// then scaled by (1 − loop_penalty · loop_score) when the field is repeating
// itself. Drives snapshot saving and the episode quality column.

use crate::atoms::constants::is_punctuation;
use crate::atoms::field_types::RecallConfig;
use crate::engine::ledger::Ledger;
use crate::engine::tokenizer::tokenize;
use std::collections::HashSet;

const MIN_WORDS: usize = 3;
const MAX_WORDS: usize = 40;

const UNIQUE_WEIGHT: f32 = 0.3;
const LENGTH_WEIGHT: f32 = 0.3;
const ECHO_WEIGHT: f32 = 0.2;
const COHERENCE_WEIGHT: f32 = 0.2;

/// Components of the quality score, kept for episode features.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityReport {
    pub unique_ratio: f32,
    pub length_score: f32,
    pub echo_ratio: f32,
    pub coherence: f32,
    pub loop_score: f32,
    pub score: f32,
}

impl QualityReport {
    /// Discount the score by how stuck recent output is.
    pub fn with_loop_score(self, loop_score: f32, penalty: f32) -> Self {
        let loop_score = if loop_score.is_finite() { loop_score.clamp(0.0, 1.0) } else { 0.0 };
        let score = (self.score * (1.0 - penalty.clamp(0.0, 1.0) * loop_score)).clamp(0.0, 1.0);
        Self { loop_score, score, ..self }
    }
}

pub fn score_quality(prompt: &str, reply: &str, ledger: &Ledger) -> QualityReport {
    let tokens = tokenize(reply);
    let words: Vec<&str> = tokens.iter().map(String::as_str).filter(|t| !is_punctuation(t)).collect();
    if words.is_empty() {
        return QualityReport::default();
    }

    let distinct: HashSet<&str> = words.iter().copied().collect();
    let unique_ratio = distinct.len() as f32 / words.len() as f32;

    let n = words.len();
    let length_score = if n < MIN_WORDS {
        n as f32 / MIN_WORDS as f32
    } else if n <= MAX_WORDS {
        1.0
    } else {
        (MAX_WORDS as f32 / n as f32).max(0.25)
    };

    let prompt_tokens = tokenize(prompt);
    let prompt_tri: HashSet<&[String]> = prompt_tokens.windows(3).collect();
    let reply_tri: Vec<&[String]> = tokens.windows(3).collect();
    let (echo_ratio, coherence) = if reply_tri.is_empty() {
        (0.0, 1.0)
    } else {
        let copied = reply_tri.iter().filter(|t| prompt_tri.contains(*t)).count();
        let known = reply_tri
            .iter()
            .filter(|t| ledger.trigram_count(&t[0], &t[1], &t[2]) > 0)
            .count();
        (copied as f32 / reply_tri.len() as f32, known as f32 / reply_tri.len() as f32)
    };

    let score = (UNIQUE_WEIGHT * unique_ratio
        + LENGTH_WEIGHT * length_score
        + ECHO_WEIGHT * (1.0 - echo_ratio)
        + COHERENCE_WEIGHT * coherence)
        .clamp(0.0, 1.0);

    QualityReport { unique_ratio, length_score, echo_ratio, coherence, loop_score: 0.0, score }
}

/// Whether a reply is good enough to keep for recall.
pub fn should_save_snapshot(report: &QualityReport, reply: &str, config: &RecallConfig) -> bool {
    report.score >= config.save_quality_threshold && !reply.trim().is_empty()
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
    fn varied_known_reply_scores_high() {
        let l = ledger("life is a beautiful resonance field");
        let q = score_quality("what is the meaning of life", "life is a beautiful resonance field", &l);
        assert!(q.score > 0.9, "{q:?}");
        assert!(should_save_snapshot(&q, "life is a beautiful resonance field", &RecallConfig::default()));
    }

    #[test]
    fn short_reply_is_penalized() {
        let l = Ledger::new();
        let q = score_quality("hello there", "hi", &l);
        assert!(q.length_score < 0.5);
        assert!(q.score < 0.9);
    }

    #[test]
    fn parroting_the_prompt_costs_echo_points() {
        let l = ledger("the cat sat on the mat");
        let fresh = score_quality("tell me a story", "the cat sat on the mat", &l);
        let parrot = score_quality("the cat sat on the mat", "the cat sat on the mat", &l);
        assert_eq!(parrot.echo_ratio, 1.0);
        assert!(parrot.score < fresh.score);
    }

    #[test]
    fn repetition_lowers_unique_ratio() {
        let q = score_quality("", "la la la la", &Ledger::new());
        assert_eq!(q.unique_ratio, 0.25);
    }

    #[test]
    fn looping_output_loses_quality() {
        let l = ledger("life is a beautiful resonance field");
        let q = score_quality("what is life", "life is a beautiful resonance field", &l);
        let stuck = q.with_loop_score(1.0, 0.5);
        assert_eq!(stuck.loop_score, 1.0);
        assert!((stuck.score - q.score * 0.5).abs() < 1e-6);
        assert!(!should_save_snapshot(&stuck, "life is a beautiful resonance field", &RecallConfig::default()));
        assert_eq!(q.with_loop_score(0.0, 0.5).score, q.score);
    }

    #[test]
    fn empty_reply_scores_zero() {
        let q = score_quality("anything", "...", &Ledger::new());
        assert_eq!(q.score, 0.0);
        assert!(!should_save_snapshot(&q, "...", &RecallConfig::default()));
    }
}
