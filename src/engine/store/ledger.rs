// Ledger tables: load the full image at open, apply write batches.
// Counts in a batch are absolute, so every row is an upsert and replaying
// a batch after a failure is harmless.

use crate::atoms::error::FieldResult;
use crate::atoms::traits::{LedgerImage, WriteOp};
use crate::engine::store::{meta, snapshots};
use rusqlite::{params, Connection, Transaction};

pub(crate) fn load_ledger(conn: &Connection) -> FieldResult<LedgerImage> {
    let mut image = LedgerImage::default();

    let mut stmt = conn.prepare("SELECT id, text FROM tokens ORDER BY id")?;
    image.tokens = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)? as u32, r.get::<_, String>(1)?)))?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare("SELECT src_id, dst_id, count FROM bigrams")?;
    image.bigrams = stmt
        .query_map([], |r| {
            Ok((r.get::<_, i64>(0)? as u32, r.get::<_, i64>(1)? as u32, r.get::<_, i64>(2)?.max(0) as u64))
        })?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare("SELECT first_id, second_id, third_id, count FROM trigrams")?;
    image.trigrams = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)? as u32,
                r.get::<_, i64>(1)? as u32,
                r.get::<_, i64>(2)? as u32,
                r.get::<_, i64>(3)?.max(0) as u64,
            ))
        })?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare("SELECT word_id, context_id, count FROM co_occurrence")?;
    image.cooccur = stmt
        .query_map([], |r| {
            Ok((r.get::<_, i64>(0)? as u32, r.get::<_, i64>(1)? as u32, r.get::<_, i64>(2)?.max(0) as u64))
        })?
        .collect::<Result<_, _>>()?;

    Ok(image)
}

/// Apply a whole batch inside one transaction.
pub(crate) fn apply_batch(conn: &mut Connection, batch: &[WriteOp]) -> FieldResult<()> {
    let tx = conn.transaction()?;
    for op in batch {
        apply_op(&tx, op)?;
    }
    tx.commit()?;
    Ok(())
}

fn apply_op(tx: &Transaction<'_>, op: &WriteOp) -> FieldResult<()> {
    match op {
        WriteOp::Tokens(rows) => {
            let mut stmt = tx.prepare_cached("INSERT OR IGNORE INTO tokens (id, text) VALUES (?1, ?2)")?;
            for (id, text) in rows {
                stmt.execute(params![*id as i64, text])?;
            }
        }
        WriteOp::Bigrams(rows) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO bigrams (src_id, dst_id, count) VALUES (?1, ?2, ?3)
                 ON CONFLICT(src_id, dst_id) DO UPDATE SET count = excluded.count",
            )?;
            for (a, b, n) in rows {
                stmt.execute(params![*a as i64, *b as i64, *n as i64])?;
            }
        }
        WriteOp::Trigrams(rows) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trigrams (first_id, second_id, third_id, count) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(first_id, second_id, third_id) DO UPDATE SET count = excluded.count",
            )?;
            for (a, b, c, n) in rows {
                stmt.execute(params![*a as i64, *b as i64, *c as i64, *n as i64])?;
            }
        }
        WriteOp::Cooccur(rows) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO co_occurrence (word_id, context_id, count) VALUES (?1, ?2, ?3)
                 ON CONFLICT(word_id, context_id) DO UPDATE SET count = excluded.count",
            )?;
            for (w, c, n) in rows {
                stmt.execute(params![*w as i64, *c as i64, *n as i64])?;
            }
        }
        WriteOp::EvictCooccur(rows) => {
            let mut stmt =
                tx.prepare_cached("DELETE FROM co_occurrence WHERE word_id = ?1 AND context_id = ?2")?;
            for (w, c) in rows {
                stmt.execute(params![*w as i64, *c as i64])?;
            }
        }
        WriteOp::InsertSnapshot(s) => snapshots::insert(tx, s)?,
        WriteOp::TouchSnapshot { id, last_used_at, use_count } => {
            snapshots::touch(tx, *id, *last_used_at, *use_count)?
        }
        WriteOp::DeleteSnapshots(ids) => snapshots::delete(tx, ids)?,
        WriteOp::SetMeta { key, value } => meta::set(tx, key, value)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::field_types::LedgerConfig;
    use crate::engine::ledger::Ledger;
    use crate::engine::store::schema::run_migrations;
    use crate::engine::tokenizer::tokenize;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn ledger_round_trips_through_sqlite() {
        let mut conn = conn();
        let mut ledger = Ledger::new();
        for text in ["the cat sat on the mat.", "the cat ran."] {
            let (_, batch) = ledger.ingest(&tokenize(text), &LedgerConfig::default());
            apply_batch(&mut conn, &batch).unwrap();
        }
        let loaded = Ledger::from_image(load_ledger(&conn).unwrap()).unwrap();
        assert_eq!(loaded.bigram_count("the", "cat"), 2);
        assert_eq!(loaded.vocab_len(), ledger.vocab_len());
        assert_eq!(loaded.cooccur_count("cat", "ran"), ledger.cooccur_count("cat", "ran"));
    }

    #[test]
    fn replaying_a_batch_does_not_double_count() {
        let mut conn = conn();
        let mut ledger = Ledger::new();
        let (_, batch) = ledger.ingest(&tokenize("a b"), &LedgerConfig::default());
        apply_batch(&mut conn, &batch).unwrap();
        apply_batch(&mut conn, &batch).unwrap();
        let loaded = Ledger::from_image(load_ledger(&conn).unwrap()).unwrap();
        assert_eq!(loaded.bigram_count("a", "b"), 1);
    }

    #[test]
    fn eviction_deletes_rows() {
        let mut conn = conn();
        let mut ledger = Ledger::new();
        let (_, batch) = ledger.ingest(&tokenize("a b"), &LedgerConfig::default());
        apply_batch(&mut conn, &batch).unwrap();
        apply_batch(&mut conn, &[WriteOp::EvictCooccur(vec![(0, 1), (1, 0)])]).unwrap();
        let image = load_ledger(&conn).unwrap();
        assert!(image.cooccur.is_empty());
        assert_eq!(image.bigrams.len(), 1);
    }
}
