// Lexfield: Field Store
// Durable storage for the ledger, snapshots, meta values and episodes.
//
// Module layout:
//   schema     idempotent migrations (ledger tables, episode tables apart)
//   ledger     ledger image load + transactional batch apply
//   snapshots  snapshot rows
//   episodes   episode rows (16 scalar feature columns)
//   meta       key/value meta table
//   memory     in-process store without durability (tests, no db_path)
//   pending    coalescing write-back queue for failed batches
//
// `SqliteStore` keeps one rusqlite connection behind a parking_lot mutex and
// runs every statement inside `tokio::task::spawn_blocking`, so the async
// field core never blocks its executor on disk I/O.

mod episodes;
mod ledger;
mod memory;
mod meta;
mod pending;
mod schema;
mod snapshots;

pub use memory::MemoryStore;
pub(crate) use pending::PendingWrites;

use crate::atoms::error::FieldResult;
use crate::atoms::field_types::{Episode, Snapshot};
use crate::atoms::traits::{EpisodeStore, LedgerImage, LedgerStore, WriteOp};
use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed store for one field namespace.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl SqliteStore {
    /// Open (or create) the database file and run ledger migrations.
    pub fn open(path: &Path) -> FieldResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("[store] Opening field store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA synchronous=NORMAL;").ok();
        Self::from_connection(conn, path.display().to_string())
    }

    /// Private in-memory database (tests, throwaway fields).
    pub fn open_in_memory() -> FieldResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, ":memory:".into())
    }

    fn from_connection(conn: Connection, name: String) -> FieldResult<Self> {
        schema::run_migrations(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), name })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> FieldResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> FieldResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_ledger(&self) -> FieldResult<LedgerImage> {
        self.with_conn(|c| ledger::load_ledger(c)).await
    }

    async fn load_snapshots(&self) -> FieldResult<Vec<Snapshot>> {
        self.with_conn(|c| snapshots::load(c)).await
    }

    async fn get_meta(&self, key: &str) -> FieldResult<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |c| meta::get(c, &key)).await
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> FieldResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_conn(move |c| ledger::apply_batch(c, &batch)).await
    }
}

#[async_trait]
impl EpisodeStore for SqliteStore {
    async fn init_episodes(&self) -> FieldResult<()> {
        self.with_conn(|c| schema::run_episode_migrations(c)).await
    }

    async fn append_episode(&self, episode: Episode) -> FieldResult<()> {
        self.with_conn(move |c| episodes::append(c, &episode)).await
    }

    async fn load_episodes(&self, limit: usize) -> FieldResult<Vec<Episode>> {
        self.with_conn(move |c| episodes::load(c, limit)).await
    }

    async fn prune_episodes(&self, keep: usize) -> FieldResult<usize> {
        self.with_conn(move |c| episodes::prune(c, keep)).await
    }
}
