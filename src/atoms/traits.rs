// ── Lexfield Atoms: Capability Traits ──────────────────────────────────────
// The seams between the field core and its durable storage. The core is
// written once against these async traits; `SqliteStore` and `MemoryStore`
// implement them, and `BlockingField` drives the same core synchronously.
//
// Optional subsystems (episodic memory) are resolved at construction time
// by whether an `EpisodeStore` was supplied and its schema initialised.

use crate::atoms::error::FieldResult;
use crate::atoms::field_types::{Episode, Snapshot, TokenId};
use async_trait::async_trait;

/// Full durable image of a ledger, loaded once at open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerImage {
    pub tokens: Vec<(TokenId, String)>,
    pub bigrams: Vec<(TokenId, TokenId, u64)>,
    pub trigrams: Vec<(TokenId, TokenId, TokenId, u64)>,
    pub cooccur: Vec<(TokenId, TokenId, u64)>,
}

/// One durable mutation. Counts are absolute post-mutation values so a
/// batch can be replayed after a failed write without double counting.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Tokens(Vec<(TokenId, String)>),
    Bigrams(Vec<(TokenId, TokenId, u64)>),
    Trigrams(Vec<(TokenId, TokenId, TokenId, u64)>),
    Cooccur(Vec<(TokenId, TokenId, u64)>),
    EvictCooccur(Vec<(TokenId, TokenId)>),
    InsertSnapshot(Snapshot),
    TouchSnapshot { id: i64, last_used_at: i64, use_count: u32 },
    DeleteSnapshots(Vec<i64>),
    SetMeta { key: String, value: String },
}

/// Durable storage for ledger, snapshots and meta values.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn load_ledger(&self) -> FieldResult<LedgerImage>;

    async fn load_snapshots(&self) -> FieldResult<Vec<Snapshot>>;

    async fn get_meta(&self, key: &str) -> FieldResult<Option<String>>;

    /// Apply a batch atomically (all or nothing).
    async fn apply(&self, batch: Vec<WriteOp>) -> FieldResult<()>;
}

/// Durable storage for episodic memory.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    /// Create tables. Failure disables episodic memory for this instance.
    async fn init_episodes(&self) -> FieldResult<()>;

    async fn append_episode(&self, episode: Episode) -> FieldResult<()>;

    /// Most recent `limit` episodes, oldest first.
    async fn load_episodes(&self, limit: usize) -> FieldResult<Vec<Episode>>;

    /// Delete all but the newest `keep` episodes. Returns rows removed.
    async fn prune_episodes(&self, keep: usize) -> FieldResult<usize>;
}
