//! Client for the upstream JetIQ curriculum API.
//!
//! The rest of the workspace only sees the [`ScheduleSource`] trait; the
//! HTTP implementation lives in [`JetIqClient`].

mod client;
mod error;
mod types;

pub use client::{DEFAULT_BASE_URL, JetIqClient};
pub use error::SourceError;
pub use types::{FacultyRecord, GroupRecord, LessonRecord, TeacherRecord};

use async_trait::async_trait;

/// Read access to the upstream schedule source.
///
/// Implementations never retry on their own: a failed fetch is reported to
/// the caller, which decides whether and when to try again.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Fetch every faculty.
    async fn fetch_faculties(&self) -> Result<Vec<FacultyRecord>, SourceError>;

    /// Fetch the groups of one faculty.
    async fn fetch_groups(&self, faculty_id: i64) -> Result<Vec<GroupRecord>, SourceError>;

    /// Fetch every teacher.
    async fn fetch_teachers(&self) -> Result<Vec<TeacherRecord>, SourceError>;

    /// Fetch the two-week lesson list of one group.
    async fn fetch_group_lessons(&self, group_id: i64) -> Result<Vec<LessonRecord>, SourceError>;
}
