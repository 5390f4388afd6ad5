// ── Field: Generator ────────────────────────────────────────────────────────
//
// Biased weighted walk over the bigram graph.
//
//   start   sampled from the ledger's centre tokens (highest out-degree),
//           never from the prompt itself unless nothing else exists
//   step    candidates are the current token's bigram successors; a known
//           trigram continuation (prev, cur) → next adds its count on top,
//           so trigram evidence breaks ties between equal bigrams
//   weight  (count/max)^(1/T) × (1 + gravity·[in prompt])
//                       × (1 + semantic_weight·theme_bias)
//                       × (1 + recall_bias)
//   stop    sentence terminal or max_tokens
//
// Prompt, themes and recalled snapshots only scale weights of edges that
// already exist; nothing is copied into the output literally. Temperatures
// at or below `GREEDY_TEMPERATURE` take the heaviest candidate.
//
// The walk is synchronous and never yields.

use crate::atoms::constants::{is_punctuation, is_terminal};
use crate::atoms::field_types::TokenId;
use crate::engine::ledger::Ledger;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// Temperatures at or below this are treated as argmax.
pub const GREEDY_TEMPERATURE: f32 = 1e-3;

/// Multiplicative biases applied to candidate weights.
#[derive(Debug, Clone, Default)]
pub struct WalkBias {
    /// Token ids present in the prompt.
    pub prompt: HashSet<TokenId>,
    /// Active-theme membership strength, 0..1.
    pub themes: HashMap<TokenId, f32>,
    /// Boosts from recalled snapshots, already scaled by recall alpha.
    pub recall: HashMap<TokenId, f32>,
}

#[derive(Debug, Clone)]
pub struct WalkParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub semantic_weight: f32,
    pub prompt_gravity: f32,
    pub center_count: usize,
}

impl WalkParams {
    /// `max` is the heaviest raw count among the competing candidates; the
    /// tempered ratio stays in 0..=1 so small temperatures cannot overflow.
    fn weight(&self, id: TokenId, count: f64, max: f64, bias: &WalkBias) -> f64 {
        if count <= 0.0 || max <= 0.0 {
            return 0.0;
        }
        let tempered = if self.greedy() {
            count
        } else {
            (count / max).powf(1.0 / self.temperature as f64)
        };
        let mut w = tempered;
        if bias.prompt.contains(&id) {
            w *= 1.0 + self.prompt_gravity as f64;
        }
        if let Some(t) = bias.themes.get(&id) {
            w *= 1.0 + (self.semantic_weight * t) as f64;
        }
        if let Some(r) = bias.recall.get(&id) {
            w *= 1.0 + *r as f64;
        }
        w
    }

    fn greedy(&self) -> bool {
        self.temperature <= GREEDY_TEMPERATURE
    }
}

/// Pick a start token from the centre pool, excluding prompt tokens.
///
/// Falls back to any vocabulary token with successors when every centre is
/// a prompt token, and to prompt tokens only when nothing else has edges.
pub fn choose_start<R: Rng + ?Sized>(
    ledger: &Ledger,
    params: &WalkParams,
    bias: &WalkBias,
    rng: &mut R,
) -> Option<TokenId> {
    let centers = ledger.centers(params.center_count);
    let mut pool: Vec<TokenId> =
        centers.iter().copied().filter(|id| !bias.prompt.contains(id)).collect();

    if pool.is_empty() {
        pool = (0..ledger.vocab_len() as TokenId)
            .filter(|id| !bias.prompt.contains(id))
            .filter(|id| ledger.successors(*id).is_some())
            .filter(|id| ledger.token(*id).is_some_and(|t| !is_punctuation(t)))
            .collect();
    }
    if pool.is_empty() {
        pool = centers;
    }
    if pool.is_empty() {
        return None;
    }

    // Out-degree as base weight keeps the start distribution anchored on
    // the strongest hubs; biases then tilt it.
    let start_params = WalkParams { prompt_gravity: 0.0, ..params.clone() };
    let degrees: Vec<(TokenId, f64)> = pool
        .into_iter()
        .map(|id| {
            let degree: u64 = ledger.successors(id).map(|r| r.values().sum()).unwrap_or(1);
            (id, degree.max(1) as f64)
        })
        .collect();
    let max = degrees.iter().map(|(_, d)| *d).fold(0.0, f64::max);
    let candidates: Vec<(TokenId, f64)> = degrees
        .into_iter()
        .map(|(id, degree)| (id, start_params.weight(id, degree, max, bias)))
        .collect();
    sample(&candidates, params.greedy(), rng)
}

/// One step from `current` (with optional predecessor `prev`).
pub fn step<R: Rng + ?Sized>(
    ledger: &Ledger,
    prev: Option<TokenId>,
    current: TokenId,
    params: &WalkParams,
    bias: &WalkBias,
    rng: &mut R,
) -> Option<TokenId> {
    let row = ledger.successors(current)?;
    let trigram = prev.and_then(|p| ledger.continuations(p, current));
    let refined: Vec<(TokenId, f64)> = row
        .iter()
        .map(|(&next, &count)| {
            let extra = trigram.and_then(|t| t.get(&next)).copied().unwrap_or(0);
            (next, (count + extra) as f64)
        })
        .collect();
    let max = refined.iter().map(|(_, c)| *c).fold(0.0, f64::max);
    let mut candidates: Vec<(TokenId, f64)> = refined
        .into_iter()
        .map(|(next, count)| (next, params.weight(next, count, max, bias)))
        .collect();
    candidates.sort_unstable_by_key(|(id, _)| *id);
    sample(&candidates, params.greedy(), rng)
}

/// Full biased walk. Returns token ids; empty only when the ledger has no
/// usable start token.
pub fn generate_walk<R: Rng + ?Sized>(
    ledger: &Ledger,
    params: &WalkParams,
    bias: &WalkBias,
    rng: &mut R,
) -> Vec<TokenId> {
    let mut out = Vec::with_capacity(params.max_tokens);
    if params.max_tokens == 0 {
        return out;
    }
    let Some(start) = choose_start(ledger, params, bias, rng) else {
        return out;
    };
    out.push(start);

    let mut cursor = Cursor::at(start);
    while out.len() < params.max_tokens {
        let next = match step(ledger, cursor.prev, cursor.current, params, bias, rng) {
            Some(next) => {
                cursor.advance(next);
                next
            }
            // dead end: restart from the centre pool
            None => match choose_start(ledger, params, bias, rng) {
                Some(s) => {
                    cursor = Cursor::at(s);
                    s
                }
                None => break,
            },
        };
        out.push(next);
        if ledger.token(next).is_some_and(is_terminal) {
            break;
        }
    }
    out
}

/// Walk position: the current token and the one that led to it. A restart
/// has no predecessor, so trigram refinement skips the jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    prev: Option<TokenId>,
    current: TokenId,
}

impl Cursor {
    fn at(current: TokenId) -> Self {
        Self { prev: None, current }
    }

    fn advance(&mut self, next: TokenId) {
        self.prev = Some(self.current);
        self.current = next;
    }
}

/// Diagnostic mode: exactly one transition per input token. Known tokens
/// with successors step once; everything else passes through unchanged.
pub fn echo_walk<R: Rng + ?Sized, S: AsRef<str>>(
    ledger: &Ledger,
    tokens: &[S],
    params: &WalkParams,
    rng: &mut R,
) -> Vec<String> {
    let bias = WalkBias::default();
    tokens
        .iter()
        .map(|tok| {
            let tok = tok.as_ref();
            ledger
                .id(tok)
                .and_then(|id| step(ledger, None, id, params, &bias, rng))
                .and_then(|next| ledger.token(next))
                .unwrap_or(tok)
                .to_string()
        })
        .collect()
}

fn sample<R: Rng + ?Sized>(candidates: &[(TokenId, f64)], greedy: bool, rng: &mut R) -> Option<TokenId> {
    let usable: Vec<&(TokenId, f64)> =
        candidates.iter().filter(|(_, w)| w.is_finite() && *w > 0.0).collect();
    if usable.is_empty() {
        return candidates.first().map(|(id, _)| *id);
    }
    if greedy {
        return usable
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(id, _)| *id);
    }
    match WeightedIndex::new(usable.iter().map(|(_, w)| *w)) {
        Ok(dist) => Some(usable[dist.sample(rng)].0),
        Err(_) => usable.first().map(|(id, _)| *id),
    }
}
