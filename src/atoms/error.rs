// ── Lexfield Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the field engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Schema, Generation…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Internal code propagates `FieldResult`; only the outward adapters on
//     `Field` (ingest / generate) turn an error into a logged fallback.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FieldError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Durable store rejected or failed a write. In-memory state stays valid.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A subsystem failed to initialise its schema and was disabled.
    #[error("Schema error: {subsystem}: {message}")]
    Schema { subsystem: String, message: String },

    /// No valid start token, empty vocabulary, or a walk that produced nothing.
    #[error("Generation error: {0}")]
    Generation(String),

    /// The decay pass itself failed; the cycle is skipped and the ledger
    /// keeps its previous counts.
    #[error("Decay error: {0}")]
    Decay(String),

    /// Configuration is invalid or could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking task or runtime failed (join error, runtime build).
    #[error("Task error: {0}")]
    Task(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl FieldError {
    /// Create a schema error for the named subsystem.
    pub fn schema(subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema { subsystem: subsystem.into(), message: message.into() }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

impl From<tokio::task::JoinError> for FieldError {
    fn from(e: tokio::task::JoinError) -> Self {
        FieldError::Task(e.to_string())
    }
}

impl From<toml::de::Error> for FieldError {
    fn from(e: toml::de::Error) -> Self {
        FieldError::Config(e.to_string())
    }
}

// ── Boundary error for `ingest` ────────────────────────────────────────────

/// Error surfaced by `Field::ingest` when `surface_errors` is enabled.
/// In production mode these are logged and swallowed.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The in-memory mutation committed but the durable write failed.
    /// The write stays queued and is retried on the next write.
    #[error("ledger persistence failed: {0}")]
    Storage(#[source] FieldError),

    /// The scheduled decay pass triggered by this ingest failed and was
    /// skipped. Decay rows that only failed to persist are `Storage`.
    #[error("scheduled decay skipped: {0}")]
    Decay(#[source] FieldError),
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All internal field operations return this type.
pub type FieldResult<T> = Result<T, FieldError>;
