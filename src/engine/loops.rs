// ── Field: Loop Detection ───────────────────────────────────────────────────
//
// Tracks how stuck the field's own output is. Reply tokens go into a sliding
// window; every n-gram inside the window that occurs more than
// `repeat_threshold` times counts as one repeat.
//
//   loop_score = min(1, repeats / saturation)
//
// Counts are taken over the window only, so state stays bounded by
// `window_tokens`. The score lowers reply quality, which keeps looping
// replies out of the snapshot store and marks their episodes.

use crate::atoms::field_types::LoopConfig;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopReport {
    pub repeated_ngrams: usize,
    pub loop_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct LoopDetector {
    history: VecDeque<String>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reply's tokens and score the window.
    pub fn observe<S: AsRef<str>>(&mut self, tokens: &[S], config: &LoopConfig) -> LoopReport {
        self.history.extend(tokens.iter().map(|t| t.as_ref().to_string()));
        while self.history.len() > config.window_tokens {
            self.history.pop_front();
        }
        self.score(config)
    }

    fn score(&self, config: &LoopConfig) -> LoopReport {
        let n = config.ngram.max(1);
        if self.history.len() < n {
            return LoopReport::default();
        }
        let window: Vec<&str> = self.history.iter().map(String::as_str).collect();
        let mut counts: HashMap<&[&str], usize> = HashMap::new();
        for gram in window.windows(n) {
            *counts.entry(gram).or_default() += 1;
        }
        let repeated_ngrams = counts.values().filter(|c| **c > config.repeat_threshold).count();
        let loop_score = (repeated_ngrams as f32 / config.saturation.max(1) as f32).min(1.0);
        LoopReport { repeated_ngrams, loop_score }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tokenizer::tokenize;

    #[test]
    fn varied_replies_are_not_loops() {
        let mut d = LoopDetector::new();
        let cfg = LoopConfig::default();
        d.observe(&tokenize("the river runs down to the sea"), &cfg);
        let r = d.observe(&tokenize("stars wheel slowly over quiet hills"), &cfg);
        assert_eq!(r, LoopReport::default());
    }

    #[test]
    fn repeated_phrase_raises_the_score() {
        let mut d = LoopDetector::new();
        let cfg = LoopConfig::default();
        let phrase = tokenize("i am stuck in the same words");
        let mut last = LoopReport::default();
        for _ in 0..4 {
            let r = d.observe(&phrase, &cfg);
            assert!(r.loop_score >= last.loop_score);
            last = r;
        }
        // every 5-gram of the seven-token cycle is now seen at least 3 times
        assert_eq!(last.repeated_ngrams, 7);
        assert_eq!(last.loop_score, 1.0);
    }

    #[test]
    fn window_forgets_old_loops() {
        let mut d = LoopDetector::new();
        let cfg = LoopConfig { window_tokens: 12, ..Default::default() };
        for _ in 0..5 {
            d.observe(&tokenize("round and round we go"), &cfg);
        }
        assert!(d.len() <= 12);
        let r = d.observe(&tokenize("a b c d e f g h i j k l"), &cfg);
        assert_eq!(r.repeated_ngrams, 0);
        d.reset();
        assert!(d.is_empty());
    }
}
