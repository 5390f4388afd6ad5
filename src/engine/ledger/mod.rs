// ── Field: Statistical Ledger ───────────────────────────────────────────────
//
// In-memory vocabulary plus bigram / trigram / co-occurrence counts.
//
// Invariants:
//   - Vocabulary is append-only: ids are assigned densely from 0 and never
//     reused. The only way tokens disappear is rebuilding from an image.
//   - Bigram and trigram counts only grow (ingest adds, nothing subtracts).
//   - Co-occurrence counts grow on ingest and shrink only through decay.
//   - A co-occurrence pair created in the same call as one of its tokens
//     starts at `novelty_initial_count` (2) so fresh vocabulary survives
//     at least one decay cycle.
//
// The ledger does no I/O. Every mutating call returns the `WriteOp`s that
// describe its effect (absolute counts) for the persistence layer.

pub mod decay;

use crate::atoms::constants::is_punctuation;
use crate::atoms::error::{FieldError, FieldResult};
use crate::atoms::field_types::{LedgerConfig, TokenId};
use crate::atoms::traits::{LedgerImage, WriteOp};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Successor counts keyed by next token.
pub type Row = HashMap<TokenId, u64>;

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    vocab: Vec<String>,
    ids: HashMap<String, TokenId>,
    bigrams: HashMap<TokenId, Row>,
    trigrams: HashMap<(TokenId, TokenId), Row>,
    cooccur: HashMap<TokenId, Row>,
}

/// Summary of one ingest call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestSummary {
    pub tokens: usize,
    pub new_tokens: usize,
    pub bigrams_touched: usize,
    pub trigrams_touched: usize,
    pub cooccur_touched: usize,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from its durable image. Token ids must be dense.
    pub fn from_image(image: LedgerImage) -> FieldResult<Self> {
        let mut ledger = Ledger::new();
        let mut tokens = image.tokens;
        tokens.sort_by_key(|(id, _)| *id);
        for (expected, (id, text)) in tokens.into_iter().enumerate() {
            if id as usize != expected {
                return Err(FieldError::storage(format!(
                    "token ids are not dense: expected {expected}, found {id}"
                )));
            }
            ledger.ids.insert(text.clone(), id);
            ledger.vocab.push(text);
        }
        let known = |id: TokenId| (id as usize) < ledger.vocab.len();
        let mut bigrams: HashMap<TokenId, Row> = HashMap::new();
        for (a, b, c) in image.bigrams {
            if known(a) && known(b) && c > 0 {
                bigrams.entry(a).or_default().insert(b, c);
            }
        }
        let mut trigrams: HashMap<(TokenId, TokenId), Row> = HashMap::new();
        for (a, b, c, n) in image.trigrams {
            if known(a) && known(b) && known(c) && n > 0 {
                trigrams.entry((a, b)).or_default().insert(c, n);
            }
        }
        let mut cooccur: HashMap<TokenId, Row> = HashMap::new();
        for (w, ctx, n) in image.cooccur {
            if known(w) && known(ctx) && n > 0 {
                cooccur.entry(w).or_default().insert(ctx, n);
            }
        }
        ledger.bigrams = bigrams;
        ledger.trigrams = trigrams;
        ledger.cooccur = cooccur;
        Ok(ledger)
    }

    /// Full durable image (used for snapshots and tests).
    pub fn to_image(&self) -> LedgerImage {
        LedgerImage {
            tokens: self.vocab.iter().enumerate().map(|(i, t)| (i as TokenId, t.clone())).collect(),
            bigrams: flatten(&self.bigrams),
            trigrams: self
                .trigrams
                .iter()
                .flat_map(|(&(a, b), row)| row.iter().map(move |(&c, &n)| (a, b, c, n)))
                .collect(),
            cooccur: flatten(&self.cooccur),
        }
    }

    // ── Ingest ───────────────────────────────────────────────────────────

    /// Add a token sequence. Returns a summary and the write batch that
    /// persists exactly the touched rows.
    pub fn ingest<S: AsRef<str>>(
        &mut self,
        tokens: &[S],
        config: &LedgerConfig,
    ) -> (IngestSummary, Vec<WriteOp>) {
        let mut summary = IngestSummary { tokens: tokens.len(), ..Default::default() };
        if tokens.is_empty() {
            return (summary, Vec::new());
        }

        let mut new_ids: HashSet<TokenId> = HashSet::new();
        let ids: Vec<TokenId> = tokens
            .iter()
            .map(|t| {
                let (id, created) = self.intern(t.as_ref());
                if created {
                    new_ids.insert(id);
                }
                id
            })
            .collect();

        let mut touched_bi: BTreeSet<(TokenId, TokenId)> = BTreeSet::new();
        for w in ids.windows(2) {
            *self.bigrams.entry(w[0]).or_default().entry(w[1]).or_insert(0) += 1;
            touched_bi.insert((w[0], w[1]));
        }

        let mut touched_tri: BTreeSet<(TokenId, TokenId, TokenId)> = BTreeSet::new();
        for w in ids.windows(3) {
            *self.trigrams.entry((w[0], w[1])).or_default().entry(w[2]).or_insert(0) += 1;
            touched_tri.insert((w[0], w[1], w[2]));
        }

        let mut touched_co: BTreeSet<(TokenId, TokenId)> = BTreeSet::new();
        let window = config.cooccur_window;
        for (i, &center) in ids.iter().enumerate() {
            let start = i.saturating_sub(window);
            let end = (i + window + 1).min(ids.len());
            for (j, &context) in ids.iter().enumerate().take(end).skip(start) {
                if j == i {
                    continue;
                }
                let row = self.cooccur.entry(center).or_default();
                match row.get_mut(&context) {
                    Some(count) => *count += 1,
                    None => {
                        let initial = if new_ids.contains(&center) || new_ids.contains(&context) {
                            config.novelty_initial_count.max(1)
                        } else {
                            1
                        };
                        row.insert(context, initial);
                    }
                }
                touched_co.insert((center, context));
            }
        }

        summary.new_tokens = new_ids.len();
        summary.bigrams_touched = touched_bi.len();
        summary.trigrams_touched = touched_tri.len();
        summary.cooccur_touched = touched_co.len();

        let mut batch = Vec::with_capacity(4);
        if !new_ids.is_empty() {
            let mut fresh: Vec<(TokenId, String)> =
                new_ids.iter().map(|&id| (id, self.vocab[id as usize].clone())).collect();
            fresh.sort_by_key(|(id, _)| *id);
            batch.push(WriteOp::Tokens(fresh));
        }
        if !touched_bi.is_empty() {
            batch.push(WriteOp::Bigrams(
                touched_bi.into_iter().map(|(a, b)| (a, b, self.bigram_count_id(a, b))).collect(),
            ));
        }
        if !touched_tri.is_empty() {
            batch.push(WriteOp::Trigrams(
                touched_tri
                    .into_iter()
                    .map(|(a, b, c)| (a, b, c, self.trigram_count_id(a, b, c)))
                    .collect(),
            ));
        }
        if !touched_co.is_empty() {
            batch.push(WriteOp::Cooccur(
                touched_co.into_iter().map(|(w, c)| (w, c, self.cooccur_count_id(w, c))).collect(),
            ));
        }
        (summary, batch)
    }

    fn intern(&mut self, token: &str) -> (TokenId, bool) {
        if let Some(&id) = self.ids.get(token) {
            return (id, false);
        }
        let id = self.vocab.len() as TokenId;
        self.vocab.push(token.to_string());
        self.ids.insert(token.to_string(), id);
        (id, true)
    }

    // ── Lookups ──────────────────────────────────────────────────────────

    pub fn vocab_len(&self) -> usize {
        self.vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty()
    }

    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.ids.get(token).copied()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.vocab.get(id as usize).map(String::as_str)
    }

    /// Ids for known tokens; unknown tokens map to `None`.
    pub fn ids_of<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<Option<TokenId>> {
        tokens.iter().map(|t| self.id(t.as_ref())).collect()
    }

    pub fn bigram_count(&self, a: &str, b: &str) -> u64 {
        match (self.id(a), self.id(b)) {
            (Some(a), Some(b)) => self.bigram_count_id(a, b),
            _ => 0,
        }
    }

    pub fn trigram_count(&self, a: &str, b: &str, c: &str) -> u64 {
        match (self.id(a), self.id(b), self.id(c)) {
            (Some(a), Some(b), Some(c)) => self.trigram_count_id(a, b, c),
            _ => 0,
        }
    }

    pub fn cooccur_count(&self, word: &str, context: &str) -> u64 {
        match (self.id(word), self.id(context)) {
            (Some(w), Some(c)) => self.cooccur_count_id(w, c),
            _ => 0,
        }
    }

    pub fn bigram_count_id(&self, a: TokenId, b: TokenId) -> u64 {
        self.bigrams.get(&a).and_then(|r| r.get(&b)).copied().unwrap_or(0)
    }

    pub fn trigram_count_id(&self, a: TokenId, b: TokenId, c: TokenId) -> u64 {
        self.trigrams.get(&(a, b)).and_then(|r| r.get(&c)).copied().unwrap_or(0)
    }

    pub fn cooccur_count_id(&self, w: TokenId, c: TokenId) -> u64 {
        self.cooccur.get(&w).and_then(|r| r.get(&c)).copied().unwrap_or(0)
    }

    /// Successor counts of `id`.
    pub fn successors(&self, id: TokenId) -> Option<&Row> {
        self.bigrams.get(&id).filter(|r| !r.is_empty())
    }

    /// Continuation counts after the pair (`a`, `b`).
    pub fn continuations(&self, a: TokenId, b: TokenId) -> Option<&Row> {
        self.trigrams.get(&(a, b)).filter(|r| !r.is_empty())
    }

    /// Co-occurrence neighbourhood of `id`.
    pub fn neighbors(&self, id: TokenId) -> Option<&Row> {
        self.cooccur.get(&id).filter(|r| !r.is_empty())
    }

    /// The whole co-occurrence table (word → context → count).
    pub fn cooccurrence(&self) -> &HashMap<TokenId, Row> {
        &self.cooccur
    }

    pub(crate) fn cooccurrence_mut(&mut self) -> &mut HashMap<TokenId, Row> {
        &mut self.cooccur
    }

    pub fn bigram_edges(&self) -> usize {
        self.bigrams.values().map(HashMap::len).sum()
    }

    pub fn trigram_edges(&self) -> usize {
        self.trigrams.values().map(HashMap::len).sum()
    }

    pub fn cooccur_edges(&self) -> usize {
        self.cooccur.values().map(HashMap::len).sum()
    }

    /// Highest out-degree (summed bigram count) tokens, punctuation excluded.
    /// Ties break toward the older (lower) id so the order is stable.
    pub fn centers(&self, k: usize) -> Vec<TokenId> {
        let mut scored: Vec<(TokenId, u64)> = self
            .bigrams
            .iter()
            .filter(|(id, _)| self.token(**id).is_some_and(|t| !is_punctuation(t)))
            .map(|(&id, row)| (id, row.values().sum()))
            .filter(|(_, w)| *w > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }
}

fn flatten(table: &HashMap<TokenId, Row>) -> Vec<(TokenId, TokenId, u64)> {
    table
        .iter()
        .flat_map(|(&a, row)| row.iter().map(move |(&b, &n)| (a, b, n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tokenizer::tokenize;

    fn cfg() -> LedgerConfig {
        LedgerConfig::default()
    }

    #[test]
    fn cat_sat_example_counts_bigrams() {
        let mut l = Ledger::new();
        l.ingest(&tokenize("the cat sat on the mat. the cat ran."), &cfg());
        assert_eq!(l.bigram_count("the", "cat"), 2);
        assert_eq!(l.bigram_count("cat", "sat"), 1);
        assert_eq!(l.bigram_count("mat", "."), 1);
        assert_eq!(l.trigram_count("the", "cat", "sat"), 1);
        assert_eq!(l.trigram_count("the", "cat", "ran"), 1);
    }

    #[test]
    fn ids_are_dense_and_never_reused() {
        let mut l = Ledger::new();
        l.ingest(&tokenize("a b c"), &cfg());
        let before: Vec<_> = ["a", "b", "c"].iter().map(|t| l.id(t)).collect();
        l.ingest(&tokenize("c d a e"), &cfg());
        let after: Vec<_> = ["a", "b", "c"].iter().map(|t| l.id(t)).collect();
        assert_eq!(before, after);
        assert_eq!(l.id("d"), Some(3));
        assert_eq!(l.id("e"), Some(4));
        assert_eq!(l.vocab_len(), 5);
    }

    #[test]
    fn novelty_bonus_applies_only_to_new_pairs_with_new_tokens() {
        let mut l = Ledger::new();
        l.ingest(&tokenize("alpha beta"), &cfg());
        // both tokens created in this call
        assert_eq!(l.cooccur_count("alpha", "beta"), 2);
        assert_eq!(l.cooccur_count("beta", "alpha"), 2);

        l.ingest(&tokenize("alpha beta"), &cfg());
        assert_eq!(l.cooccur_count("alpha", "beta"), 3);

        // gamma is new, alpha is not: the new pair still gets the bonus
        l.ingest(&tokenize("alpha gamma"), &cfg());
        assert_eq!(l.cooccur_count("alpha", "gamma"), 2);

        // both known, pair new: plain 1
        l.ingest(&tokenize("beta gamma"), &cfg());
        assert_eq!(l.cooccur_count("beta", "gamma"), 1);
    }

    #[test]
    fn cooccurrence_window_is_bounded() {
        let mut l = Ledger::new();
        let cfg = LedgerConfig { cooccur_window: 2, novelty_initial_count: 1 };
        l.ingest(&tokenize("a b c d e"), &cfg);
        assert_eq!(l.cooccur_count("a", "c"), 1);
        assert_eq!(l.cooccur_count("a", "d"), 0);
    }

    #[test]
    fn write_batch_carries_absolute_counts() {
        let mut l = Ledger::new();
        l.ingest(&tokenize("x y x y"), &cfg());
        let (_, batch) = l.ingest(&tokenize("x y"), &cfg());
        let bigrams = batch
            .iter()
            .find_map(|op| match op {
                WriteOp::Bigrams(rows) => Some(rows.clone()),
                _ => None,
            })
            .unwrap();
        let x = l.id("x").unwrap();
        let y = l.id("y").unwrap();
        assert_eq!(bigrams, vec![(x, y, 3)]);
        // no new tokens in the second call
        assert!(!batch.iter().any(|op| matches!(op, WriteOp::Tokens(_))));
    }

    #[test]
    fn image_round_trip_preserves_counts() {
        let mut l = Ledger::new();
        l.ingest(&tokenize("one two three one two"), &cfg());
        let rebuilt = Ledger::from_image(l.to_image()).unwrap();
        assert_eq!(rebuilt.vocab_len(), l.vocab_len());
        assert_eq!(rebuilt.bigram_count("one", "two"), 2);
        assert_eq!(rebuilt.trigram_count("one", "two", "three"), 1);
        assert_eq!(rebuilt.cooccur_count("one", "three"), l.cooccur_count("one", "three"));
    }

    #[test]
    fn sparse_image_is_rejected() {
        let image = LedgerImage { tokens: vec![(0, "a".into()), (2, "b".into())], ..Default::default() };
        assert!(Ledger::from_image(image).is_err());
    }

    #[test]
    fn centers_rank_by_out_degree_and_skip_punctuation() {
        let mut l = Ledger::new();
        l.ingest(&tokenize("the cat . the dog . the end . cat naps"), &cfg());
        let centers: Vec<&str> = l.centers(3).into_iter().filter_map(|id| l.token(id)).collect();
        assert_eq!(centers[0], "the");
        assert!(!centers.contains(&"."));
    }
}
