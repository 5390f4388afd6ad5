// Database schema and migrations for the field store.
// Called once by SqliteStore::open() after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT EXISTS
// or ALTER TABLE … ADD COLUMN at the end of the relevant function; never
// modify existing SQL so older files keep upgrading cleanly.
//
// Episode tables live in their own function: a failure there disables
// episodic memory without taking the ledger down with it.

use crate::atoms::error::{FieldError, FieldResult};
use crate::engine::store::episodes::FEATURE_COLUMNS;
use log::info;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> FieldResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY,
            text TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS bigrams (
            src_id INTEGER NOT NULL,
            dst_id INTEGER NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY (src_id, dst_id)
        );

        CREATE TABLE IF NOT EXISTS trigrams (
            first_id INTEGER NOT NULL,
            second_id INTEGER NOT NULL,
            third_id INTEGER NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY (first_id, second_id, third_id)
        );

        CREATE TABLE IF NOT EXISTS co_occurrence (
            word_id INTEGER NOT NULL,
            context_id INTEGER NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY (word_id, context_id)
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            quality REAL NOT NULL,
            emotional REAL NOT NULL,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER,
            use_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_quality
            ON snapshots(quality, created_at);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| FieldError::schema("ledger", e.to_string()))?;
    info!("[store] Ledger schema ready");
    Ok(())
}

pub(crate) fn run_episode_migrations(conn: &Connection) -> FieldResult<()> {
    let features: String = FEATURE_COLUMNS
        .iter()
        .map(|c| format!("            {c} REAL NOT NULL DEFAULT 0,\n"))
        .collect();
    let ddl = format!(
        "
        CREATE TABLE IF NOT EXISTS episodes (
            id INTEGER PRIMARY KEY,
            created_at INTEGER NOT NULL,
            prompt TEXT NOT NULL,
            reply TEXT NOT NULL,
{features}            expert TEXT NOT NULL,
            quality REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_episodes_created
            ON episodes(created_at);
        "
    );
    conn.execute_batch(&ddl)
        .map_err(|e| FieldError::schema("episodes", e.to_string()))?;
    info!("[store] Episode schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        run_episode_migrations(&conn).unwrap();
        run_episode_migrations(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('tokens','bigrams','trigrams','co_occurrence','snapshots','meta','episodes')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn episode_table_has_every_feature_column() {
        let conn = Connection::open_in_memory().unwrap();
        run_episode_migrations(&conn).unwrap();
        let cols: Vec<String> = conn
            .prepare("SELECT name FROM pragma_table_info('episodes')")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for c in FEATURE_COLUMNS {
            assert!(cols.iter().any(|x| x == c), "missing column {c}");
        }
    }
}
