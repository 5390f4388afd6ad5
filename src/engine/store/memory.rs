// In-process store with no durability. Used when no `db_path` is set and by
// tests, which can switch write failures on to exercise the degraded paths.

use crate::atoms::error::{FieldError, FieldResult};
use crate::atoms::field_types::{Episode, Snapshot, TokenId};
use crate::atoms::traits::{EpisodeStore, LedgerImage, LedgerStore, WriteOp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct Tables {
    tokens: BTreeMap<TokenId, String>,
    bigrams: HashMap<(TokenId, TokenId), u64>,
    trigrams: HashMap<(TokenId, TokenId, TokenId), u64>,
    cooccur: HashMap<(TokenId, TokenId), u64>,
    snapshots: BTreeMap<i64, Snapshot>,
    meta: HashMap<String, String>,
    episodes: BTreeMap<i64, Episode>,
    episodes_ready: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    fail_episode_init: AtomicBool,
    applied_batches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `apply` / `append_episode` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `init_episodes` fail, as a broken episode schema would.
    pub fn set_fail_episode_init(&self, fail: bool) {
        self.fail_episode_init.store(fail, Ordering::SeqCst);
    }

    /// Number of batches successfully applied.
    pub fn applied_batches(&self) -> usize {
        self.applied_batches.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> FieldResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(FieldError::storage("memory store is refusing writes"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_ledger(&self) -> FieldResult<LedgerImage> {
        let t = self.tables.lock();
        Ok(LedgerImage {
            tokens: t.tokens.iter().map(|(id, s)| (*id, s.clone())).collect(),
            bigrams: t.bigrams.iter().map(|(&(a, b), &n)| (a, b, n)).collect(),
            trigrams: t.trigrams.iter().map(|(&(a, b, c), &n)| (a, b, c, n)).collect(),
            cooccur: t.cooccur.iter().map(|(&(w, c), &n)| (w, c, n)).collect(),
        })
    }

    async fn load_snapshots(&self) -> FieldResult<Vec<Snapshot>> {
        Ok(self.tables.lock().snapshots.values().cloned().collect())
    }

    async fn get_meta(&self, key: &str) -> FieldResult<Option<String>> {
        Ok(self.tables.lock().meta.get(key).cloned())
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> FieldResult<()> {
        self.check_writable()?;
        let mut t = self.tables.lock();
        for op in batch {
            match op {
                WriteOp::Tokens(rows) => {
                    for (id, text) in rows {
                        t.tokens.entry(id).or_insert(text);
                    }
                }
                WriteOp::Bigrams(rows) => t.bigrams.extend(rows.into_iter().map(|(a, b, n)| ((a, b), n))),
                WriteOp::Trigrams(rows) => {
                    t.trigrams.extend(rows.into_iter().map(|(a, b, c, n)| ((a, b, c), n)))
                }
                WriteOp::Cooccur(rows) => t.cooccur.extend(rows.into_iter().map(|(w, c, n)| ((w, c), n))),
                WriteOp::EvictCooccur(rows) => {
                    for key in rows {
                        t.cooccur.remove(&key);
                    }
                }
                WriteOp::InsertSnapshot(s) => {
                    t.snapshots.insert(s.id, s);
                }
                WriteOp::TouchSnapshot { id, last_used_at, use_count } => {
                    if let Some(s) = t.snapshots.get_mut(&id) {
                        s.last_used_at = Some(last_used_at);
                        s.use_count = use_count;
                    }
                }
                WriteOp::DeleteSnapshots(ids) => {
                    for id in ids {
                        t.snapshots.remove(&id);
                    }
                }
                WriteOp::SetMeta { key, value } => {
                    t.meta.insert(key, value);
                }
            }
        }
        self.applied_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EpisodeStore for MemoryStore {
    async fn init_episodes(&self) -> FieldResult<()> {
        if self.fail_episode_init.load(Ordering::SeqCst) {
            return Err(FieldError::schema("episodes", "memory store episode init disabled"));
        }
        self.tables.lock().episodes_ready = true;
        Ok(())
    }

    async fn append_episode(&self, episode: Episode) -> FieldResult<()> {
        self.check_writable()?;
        let mut t = self.tables.lock();
        if !t.episodes_ready {
            return Err(FieldError::schema("episodes", "episode tables not initialised"));
        }
        t.episodes.insert(episode.id, episode);
        Ok(())
    }

    async fn load_episodes(&self, limit: usize) -> FieldResult<Vec<Episode>> {
        let t = self.tables.lock();
        let skip = t.episodes.len().saturating_sub(limit);
        Ok(t.episodes.values().skip(skip).cloned().collect())
    }

    async fn prune_episodes(&self, keep: usize) -> FieldResult<usize> {
        let mut t = self.tables.lock();
        let excess = t.episodes.len().saturating_sub(keep);
        let doomed: Vec<i64> = t.episodes.keys().take(excess).copied().collect();
        for id in &doomed {
            t.episodes.remove(id);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_writes_leave_tables_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let batch = vec![WriteOp::Tokens(vec![(0, "a".into())])];
        assert!(store.apply(batch.clone()).await.is_err());
        assert!(store.load_ledger().await.unwrap().tokens.is_empty());

        store.set_fail_writes(false);
        store.apply(batch).await.unwrap();
        assert_eq!(store.load_ledger().await.unwrap().tokens.len(), 1);
        assert_eq!(store.applied_batches(), 1);
    }

    #[tokio::test]
    async fn episode_init_failure_is_reported() {
        let store = MemoryStore::new();
        store.set_fail_episode_init(true);
        assert!(matches!(store.init_episodes().await, Err(FieldError::Schema { .. })));
    }
}
