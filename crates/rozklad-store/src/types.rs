//! Entity types and write operations.

use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four mirrored entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Faculty,
    Group,
    Teacher,
    Lesson,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Faculty => "faculty",
            EntityKind::Group => "group",
            EntityKind::Teacher => "teacher",
            EntityKind::Lesson => "lesson",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored faculty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faculty {
    pub id: i64,
    pub name: String,
    /// Absent from the latest upstream snapshot but kept.
    pub stale: bool,
    pub discovered_at: DateTime<Utc>,
}

/// A stored group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub faculty_id: i64,
    pub stale: bool,
    pub discovered_at: DateTime<Utc>,
}

/// A stored teacher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: i64,
    pub name: String,
    pub stale: bool,
    pub discovered_at: DateTime<Utc>,
}

/// Everything about a lesson except its generated id and timestamp.
///
/// Two lessons with equal content are indistinguishable; the reconciler
/// compares lessons by content only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LessonContent {
    pub group_id: i64,
    pub teacher_id: i64,
    pub num: i64,
    pub auditory: String,
    pub kind: String,
    pub subgroup: i64,
    pub subject: String,
    pub begin: NaiveTime,
    pub end: NaiveTime,
    pub dow: String,
    pub week_num: i64,
}

/// A stored lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Uuid,
    #[serde(flatten)]
    pub content: LessonContent,
    pub discovered_at: DateTime<Utc>,
}

/// A single write in a batch applied by [`crate::Storage::apply`].
///
/// `Put*` inserts the row or updates its name and clears the stale flag;
/// `discovered_at` is only ever set on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    PutFaculty { id: i64, name: String },
    PutGroup { id: i64, name: String, faculty_id: i64 },
    PutTeacher { id: i64, name: String },
    /// Flag a faculty, group or teacher as absent upstream.
    MarkStale { kind: EntityKind, id: i64 },
    /// Delete a faculty with its groups and their lessons.
    DeleteFaculty { id: i64 },
    /// Delete a group with its lessons.
    DeleteGroup { id: i64 },
    /// Delete a teacher no lesson references.
    DeleteTeacher { id: i64 },
    InsertLesson { id: Uuid, content: LessonContent },
    DeleteLesson { id: Uuid },
}
