// ── Field: Trauma Tracker ───────────────────────────────────────────────────
//
// Tracks "identity pressure": exchanges that lean on the field's own origin
// text. Each exchange gets a score
//
//   min(1, 2 · overlap(exchange tokens, identity lexicon))
//     + 0.3·novelty + 0.4·arousal + 0.2·entropy
//     + 0.2 if a trigger phrase appears
//
// clamped to [0, 1]. Scores at or above `event_threshold` are events and
// move the level to 0.5·score + 0.5·mean(recent events). Between events the
// level halves every `half_life_hours`. The router reads the level.
//
// Without an identity lexicon (no bootstrap text) nothing registers.

use crate::atoms::constants::is_punctuation;
use crate::atoms::field_types::{PresencePulse, TraumaConfig};
use crate::engine::tokenizer::tokenize;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Recent event scores kept for smoothing.
const HISTORY_LEN: usize = 10;
const TRIGGER_BONUS: f32 = 0.2;

/// Persisted part of the tracker (stored as JSON in meta).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraumaState {
    pub level: f32,
    /// Unix seconds the level was last computed at.
    pub updated_at: i64,
    pub last_event_at: Option<i64>,
    pub history: VecDeque<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct TraumaTracker {
    state: TraumaState,
    lexicon: HashSet<String>,
}

impl TraumaTracker {
    pub fn new(identity_text: Option<&str>) -> Self {
        Self::with_state(identity_text, TraumaState::default())
    }

    pub fn with_state(identity_text: Option<&str>, state: TraumaState) -> Self {
        let lexicon = identity_text
            .map(|t| tokenize(t).into_iter().filter(|w| !is_punctuation(w)).collect())
            .unwrap_or_default();
        Self { state, lexicon }
    }

    pub fn state(&self) -> &TraumaState {
        &self.state
    }

    /// Current level decayed to `now`, without mutating.
    pub fn level(&self, now: i64, config: &TraumaConfig) -> f32 {
        decayed(self.state.level, self.state.updated_at, now, config)
    }

    /// Score one exchange and update the level. Returns the score when the
    /// exchange counted as an event.
    pub fn observe(
        &mut self,
        prompt: &str,
        reply: &str,
        pulse: &PresencePulse,
        now: i64,
        config: &TraumaConfig,
    ) -> Option<f32> {
        self.state.level = self.level(now, config);
        self.state.updated_at = now;
        if self.lexicon.is_empty() {
            return None;
        }

        let score = self.score(prompt, reply, pulse, config);
        if score < config.event_threshold {
            return None;
        }

        self.state.history.push_back(score);
        while self.state.history.len() > HISTORY_LEN {
            self.state.history.pop_front();
        }
        let mean = self.state.history.iter().sum::<f32>() / self.state.history.len() as f32;
        self.state.level = (0.5 * score + 0.5 * mean).clamp(0.0, 1.0);
        self.state.last_event_at = Some(now);
        debug!("[trauma] Event score {:.2}, level now {:.2}", score, self.state.level);
        Some(score)
    }

    fn score(&self, prompt: &str, reply: &str, pulse: &PresencePulse, config: &TraumaConfig) -> f32 {
        let prompt_tokens = tokenize(prompt);
        let reply_tokens = tokenize(reply);
        let words: HashSet<&str> = prompt_tokens
            .iter()
            .chain(reply_tokens.iter())
            .map(String::as_str)
            .filter(|t| !is_punctuation(t))
            .collect();
        if words.is_empty() {
            return 0.0;
        }
        let overlap = words.iter().filter(|w| self.lexicon.contains(**w)).count() as f32 / words.len() as f32;
        let mut score = (overlap * 2.0).min(1.0);
        score += 0.3 * pulse.novelty + 0.4 * pulse.arousal + 0.2 * pulse.entropy;

        let joined = prompt_tokens
            .iter()
            .chain(reply_tokens.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        if config.trigger_phrases.iter().any(|p| joined.contains(&p.to_lowercase())) {
            score += TRIGGER_BONUS;
        }
        score.clamp(0.0, 1.0)
    }
}

fn decayed(level: f32, since: i64, now: i64, config: &TraumaConfig) -> f32 {
    if config.half_life_hours <= 0.0 || now <= since {
        return level;
    }
    let hours = (now - since) as f64 / 3600.0;
    (level as f64 * 0.5f64.powf(hours / config.half_life_hours)) as f32
}
