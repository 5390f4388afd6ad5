// Lexfield: a statistical language field. Text is folded into an n-gram and
// co-occurrence ledger; replies are biased random walks over it, steered by
// presence metrics, themes, recalled snapshots and an expert router.

pub mod atoms;
pub mod engine;

pub use atoms::error::{FieldError, FieldResult, IngestError};
pub use atoms::field_types::{
    default_db_path, Episode, EpisodeFeatures, Expert, FieldConfig, FieldStats, PresencePulse, Snapshot,
};
pub use engine::blocking::BlockingField;
pub use engine::field::{Capabilities, Field, GenerateParams, Reply};
pub use engine::store::{MemoryStore, SqliteStore};
