// Write-back queue for batches the durable store rejected.
//
// Every `WriteOp` carries absolute values, so only the latest value per row
// matters. The queue keeps one entry per (table, key) and is therefore
// bounded by the number of distinct rows touched during an outage, not by
// the number of failed writes.

use crate::atoms::field_types::{Snapshot, TokenId};
use crate::atoms::traits::WriteOp;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
enum SnapshotWrite {
    Insert(Snapshot),
    Touch { last_used_at: i64, use_count: u32 },
    Delete,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PendingWrites {
    tokens: BTreeMap<TokenId, String>,
    bigrams: BTreeMap<(TokenId, TokenId), u64>,
    trigrams: BTreeMap<(TokenId, TokenId, TokenId), u64>,
    /// `None` marks an eviction.
    cooccur: BTreeMap<(TokenId, TokenId), Option<u64>>,
    snapshots: BTreeMap<i64, SnapshotWrite>,
    meta: BTreeMap<String, String>,
}

impl PendingWrites {
    pub(crate) fn extend(&mut self, batch: impl IntoIterator<Item = WriteOp>) {
        for op in batch {
            self.push(op);
        }
    }

    pub(crate) fn push(&mut self, op: WriteOp) {
        match op {
            WriteOp::Tokens(rows) => self.tokens.extend(rows),
            WriteOp::Bigrams(rows) => self.bigrams.extend(rows.into_iter().map(|(a, b, n)| ((a, b), n))),
            WriteOp::Trigrams(rows) => {
                self.trigrams.extend(rows.into_iter().map(|(a, b, c, n)| ((a, b, c), n)))
            }
            WriteOp::Cooccur(rows) => {
                self.cooccur.extend(rows.into_iter().map(|(w, c, n)| ((w, c), Some(n))))
            }
            WriteOp::EvictCooccur(rows) => self.cooccur.extend(rows.into_iter().map(|key| (key, None))),
            WriteOp::InsertSnapshot(s) => {
                self.snapshots.insert(s.id, SnapshotWrite::Insert(s));
            }
            WriteOp::TouchSnapshot { id, last_used_at, use_count } => match self.snapshots.get_mut(&id) {
                // not yet inserted durably: fold the use stats into the insert
                Some(SnapshotWrite::Insert(s)) => {
                    s.last_used_at = Some(last_used_at);
                    s.use_count = use_count;
                }
                Some(SnapshotWrite::Delete) => {}
                _ => {
                    self.snapshots.insert(id, SnapshotWrite::Touch { last_used_at, use_count });
                }
            },
            WriteOp::DeleteSnapshots(ids) => {
                self.snapshots.extend(ids.into_iter().map(|id| (id, SnapshotWrite::Delete)))
            }
            WriteOp::SetMeta { key, value } => {
                self.meta.insert(key, value);
            }
        }
    }

    /// Queued rows.
    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
            + self.bigrams.len()
            + self.trigrams.len()
            + self.cooccur.len()
            + self.snapshots.len()
            + self.meta.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// One ordered batch: tokens before the edges that reference them,
    /// snapshot rows before meta.
    pub(crate) fn to_batch(&self) -> Vec<WriteOp> {
        let mut batch = Vec::new();
        if !self.tokens.is_empty() {
            batch.push(WriteOp::Tokens(self.tokens.iter().map(|(id, t)| (*id, t.clone())).collect()));
        }
        if !self.bigrams.is_empty() {
            batch.push(WriteOp::Bigrams(self.bigrams.iter().map(|(&(a, b), &n)| (a, b, n)).collect()));
        }
        if !self.trigrams.is_empty() {
            batch.push(WriteOp::Trigrams(self.trigrams.iter().map(|(&(a, b, c), &n)| (a, b, c, n)).collect()));
        }
        let upserts: Vec<_> = self.cooccur.iter().filter_map(|(&(w, c), n)| n.map(|n| (w, c, n))).collect();
        if !upserts.is_empty() {
            batch.push(WriteOp::Cooccur(upserts));
        }
        let evictions: Vec<_> = self.cooccur.iter().filter(|(_, n)| n.is_none()).map(|(k, _)| *k).collect();
        if !evictions.is_empty() {
            batch.push(WriteOp::EvictCooccur(evictions));
        }

        let mut deleted = Vec::new();
        for (&id, write) in &self.snapshots {
            match write {
                SnapshotWrite::Insert(s) => batch.push(WriteOp::InsertSnapshot(s.clone())),
                SnapshotWrite::Touch { last_used_at, use_count } => batch.push(WriteOp::TouchSnapshot {
                    id,
                    last_used_at: *last_used_at,
                    use_count: *use_count,
                }),
                SnapshotWrite::Delete => deleted.push(id),
            }
        }
        if !deleted.is_empty() {
            batch.push(WriteOp::DeleteSnapshots(deleted));
        }

        batch.extend(
            self.meta.iter().map(|(key, value)| WriteOp::SetMeta { key: key.clone(), value: value.clone() }),
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: i64) -> Snapshot {
        Snapshot {
            id,
            text: format!("reply {id}"),
            quality: 0.8,
            emotional: 0.1,
            created_at: 10,
            last_used_at: None,
            use_count: 0,
        }
    }

    #[test]
    fn repeated_rows_keep_the_latest_value() {
        let mut q = PendingWrites::default();
        for n in 1..=100u64 {
            q.extend(vec![
                WriteOp::Bigrams(vec![(0, 1, n)]),
                WriteOp::SetMeta { key: "ingest_count".into(), value: n.to_string() },
            ]);
        }
        assert_eq!(q.len(), 2);
        assert_eq!(
            q.to_batch(),
            vec![
                WriteOp::Bigrams(vec![(0, 1, 100)]),
                WriteOp::SetMeta { key: "ingest_count".into(), value: "100".into() },
            ]
        );
    }

    #[test]
    fn eviction_and_upsert_replace_each_other() {
        let mut q = PendingWrites::default();
        q.push(WriteOp::Cooccur(vec![(1, 2, 2), (3, 4, 5)]));
        q.push(WriteOp::EvictCooccur(vec![(1, 2)]));
        q.push(WriteOp::EvictCooccur(vec![(3, 4)]));
        q.push(WriteOp::Cooccur(vec![(3, 4, 1)]));
        assert_eq!(
            q.to_batch(),
            vec![WriteOp::Cooccur(vec![(3, 4, 1)]), WriteOp::EvictCooccur(vec![(1, 2)])]
        );
    }

    #[test]
    fn touch_folds_into_queued_insert() {
        let mut q = PendingWrites::default();
        q.push(WriteOp::InsertSnapshot(snapshot(1)));
        q.push(WriteOp::TouchSnapshot { id: 1, last_used_at: 50, use_count: 2 });
        q.push(WriteOp::TouchSnapshot { id: 2, last_used_at: 60, use_count: 4 });
        let batch = q.to_batch();
        let expected = Snapshot { last_used_at: Some(50), use_count: 2, ..snapshot(1) };
        assert_eq!(batch[0], WriteOp::InsertSnapshot(expected));
        assert_eq!(batch[1], WriteOp::TouchSnapshot { id: 2, last_used_at: 60, use_count: 4 });
    }

    #[test]
    fn delete_wins_over_later_touch() {
        let mut q = PendingWrites::default();
        q.push(WriteOp::InsertSnapshot(snapshot(3)));
        q.push(WriteOp::DeleteSnapshots(vec![3]));
        q.push(WriteOp::TouchSnapshot { id: 3, last_used_at: 70, use_count: 1 });
        assert_eq!(q.to_batch(), vec![WriteOp::DeleteSnapshots(vec![3])]);
        q.clear();
        assert!(q.is_empty());
    }
}
