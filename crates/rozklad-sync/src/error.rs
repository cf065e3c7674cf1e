//! Error types for synchronization.

use std::time::Duration;

use rozklad_source::SourceError;
use rozklad_store::{EntityKind, StoreError};
use thiserror::Error;

/// Errors that can occur while refreshing the mirror.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream fetch failed.
    #[error("upstream error: {0}")]
    Source(#[from] SourceError),

    /// A batch referenced an entity that is not stored.
    #[error("missing dependency: {kind} {id}")]
    MissingDependency { kind: EntityKind, id: i64 },

    /// A dependency was still missing after the one repair pass.
    #[error("pipeline failed: {0}")]
    PipelineFailed(String),

    /// Storage error other than a missing reference.
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// Upstream moved an existing group to another faculty.
    #[error("group {group_id} moved from faculty {from} to {to}")]
    OwnerChanged { group_id: i64, from: i64, to: i64 },

    /// Another refresh of the same scope is in progress.
    #[error("refresh already in progress, retry in {}s", retry_after.as_secs())]
    GuardAlreadyHeld { retry_after: Duration },
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKey { kind, id } => SyncError::MissingDependency { kind, id },
            other => SyncError::Storage(other),
        }
    }
}

impl SyncError {
    /// Whether this is a missing teacher, the one case the pipeline repairs.
    pub fn is_missing_teacher(&self) -> bool {
        matches!(
            self,
            SyncError::MissingDependency {
                kind: EntityKind::Teacher,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_becomes_missing_dependency() {
        let err: SyncError = StoreError::ForeignKey {
            kind: EntityKind::Teacher,
            id: 42,
        }
        .into();
        assert!(err.is_missing_teacher());
        assert_eq!(err.to_string(), "missing dependency: teacher 42");
    }

    #[test]
    fn test_other_store_errors_stay_storage() {
        let err: SyncError = StoreError::LockPoisoned.into();
        assert!(matches!(err, SyncError::Storage(StoreError::LockPoisoned)));
        assert!(!err.is_missing_teacher());
    }

    #[test]
    fn test_guard_message_in_seconds() {
        let err = SyncError::GuardAlreadyHeld {
            retry_after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "refresh already in progress, retry in 90s");
    }
}
