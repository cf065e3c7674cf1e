//! Error types for storage.

use thiserror::Error;

use crate::EntityKind;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A write referenced an entity that does not exist.
    #[error("missing {kind} {id}")]
    ForeignKey { kind: EntityKind, id: i64 },

    /// The connection mutex was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// The operation does not apply to this entity kind.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The blocking task running a statement panicked or was cancelled.
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}
