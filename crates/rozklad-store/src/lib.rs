//! Storage for rozklad.
//!
//! This crate provides:
//! - The four mirrored entity kinds and the write operations that change them
//! - A SQLite-backed [`Storage`] with foreign keys enforced and atomic batches
//! - A TTL key/value [`CacheStore`] with an atomic conditional set

pub mod cache;
mod db;
mod error;
mod types;

pub use cache::{CacheStore, MemoryCache};
pub use db::SqliteStore;
pub use error::StoreError;
pub use types::{EntityKind, Faculty, Group, Lesson, LessonContent, Teacher, WriteOp};

use async_trait::async_trait;
use uuid::Uuid;

/// Transactional access to the mirrored entities.
///
/// Reads return stale-flagged rows as well; callers decide whether to show
/// them. Writes go through [`Storage::apply`], which commits a whole batch or
/// nothing.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn faculties(&self) -> Result<Vec<Faculty>, StoreError>;

    async fn faculty(&self, id: i64) -> Result<Option<Faculty>, StoreError>;

    async fn groups(&self) -> Result<Vec<Group>, StoreError>;

    async fn groups_of_faculty(&self, faculty_id: i64) -> Result<Vec<Group>, StoreError>;

    async fn group(&self, id: i64) -> Result<Option<Group>, StoreError>;

    async fn teachers(&self) -> Result<Vec<Teacher>, StoreError>;

    async fn teacher(&self, id: i64) -> Result<Option<Teacher>, StoreError>;

    async fn lessons_of_group(&self, group_id: i64) -> Result<Vec<Lesson>, StoreError>;

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, StoreError>;

    /// Distinct ids of the groups that have a lesson taught by any of `teacher_ids`.
    async fn groups_taught_by(&self, teacher_ids: &[i64]) -> Result<Vec<i64>, StoreError>;

    /// The subset of `teacher_ids` still referenced by at least one lesson.
    async fn teachers_in_use(&self, teacher_ids: &[i64]) -> Result<Vec<i64>, StoreError>;

    /// Apply a batch of writes in one transaction.
    ///
    /// Returns the number of rows touched. A reference to a missing faculty,
    /// group or teacher aborts the whole batch with
    /// [`StoreError::ForeignKey`].
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<usize, StoreError>;
}
