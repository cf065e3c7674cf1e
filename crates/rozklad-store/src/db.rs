//! SQLite storage for the mirrored entities.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    EntityKind, Faculty, Group, Lesson, LessonContent, Storage, StoreError, Teacher, WriteOp,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS faculties (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        stale INTEGER NOT NULL DEFAULT 0,
        discovered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS teachers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        stale INTEGER NOT NULL DEFAULT 0,
        discovered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS study_groups (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        faculty_id INTEGER NOT NULL REFERENCES faculties(id) ON DELETE CASCADE,
        stale INTEGER NOT NULL DEFAULT 0,
        discovered_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_groups_faculty ON study_groups(faculty_id);

    CREATE TABLE IF NOT EXISTS lessons (
        id TEXT PRIMARY KEY,
        group_id INTEGER NOT NULL REFERENCES study_groups(id) ON DELETE CASCADE,
        teacher_id INTEGER NOT NULL REFERENCES teachers(id),
        num INTEGER NOT NULL,
        auditory TEXT NOT NULL,
        kind TEXT NOT NULL,
        subgroup INTEGER NOT NULL,
        subject TEXT NOT NULL,
        begins_at TEXT NOT NULL,
        ends_at TEXT NOT NULL,
        dow TEXT NOT NULL,
        week_num INTEGER NOT NULL,
        discovered_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_lessons_group ON lessons(group_id);
    CREATE INDEX IF NOT EXISTS idx_lessons_teacher ON lessons(teacher_id);
";

const LESSON_COLUMNS: &str = "id, group_id, teacher_id, num, auditory, kind, subgroup, subject, \
                              begins_at, ends_at, dow, week_num, discovered_at";

/// SQLite-backed storage.
///
/// Every statement runs on tokio's blocking pool so a slow disk never stalls
/// the runtime threads driving fetches and the HTTP API.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::init(conn)?;
        info!(path = %path.display(), "database initialized");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

fn table_for(kind: EntityKind) -> Result<&'static str, StoreError> {
    match kind {
        EntityKind::Faculty => Ok("faculties"),
        EntityKind::Group => Ok("study_groups"),
        EntityKind::Teacher => Ok("teachers"),
        EntityKind::Lesson => Err(StoreError::Unsupported(
            "lessons are replaced per group, not flagged".to_string(),
        )),
    }
}

fn faculty_from_row(row: &Row<'_>) -> rusqlite::Result<Faculty> {
    Ok(Faculty {
        id: row.get(0)?,
        name: row.get(1)?,
        stale: row.get(2)?,
        discovered_at: row.get(3)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        faculty_id: row.get(2)?,
        stale: row.get(3)?,
        discovered_at: row.get(4)?,
    })
}

fn teacher_from_row(row: &Row<'_>) -> rusqlite::Result<Teacher> {
    Ok(Teacher {
        id: row.get(0)?,
        name: row.get(1)?,
        stale: row.get(2)?,
        discovered_at: row.get(3)?,
    })
}

/// A lesson row whose id has not been decoded yet.
struct LessonRow {
    raw_id: String,
    content: LessonContent,
    discovered_at: DateTime<Utc>,
}

impl TryFrom<LessonRow> for Lesson {
    type Error = StoreError;

    fn try_from(row: LessonRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.raw_id)
            .map_err(|e| StoreError::Corrupt(format!("lesson id {:?}: {}", row.raw_id, e)))?;
        Ok(Lesson {
            id,
            content: row.content,
            discovered_at: row.discovered_at,
        })
    }
}

fn lesson_from_row(row: &Row<'_>) -> rusqlite::Result<LessonRow> {
    Ok(LessonRow {
        raw_id: row.get(0)?,
        content: LessonContent {
            group_id: row.get(1)?,
            teacher_id: row.get(2)?,
            num: row.get(3)?,
            auditory: row.get(4)?,
            kind: row.get(5)?,
            subgroup: row.get(6)?,
            subject: row.get(7)?,
            begin: row.get(8)?,
            end: row.get(9)?,
            dow: row.get(10)?,
            week_num: row.get(11)?,
        },
        discovered_at: row.get(12)?,
    })
}

fn row_exists(tx: &Transaction<'_>, table: &str, id: i64) -> rusqlite::Result<bool> {
    tx.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?1", table),
        params![id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Apply one write inside an open transaction. Returns rows touched.
fn apply_op(tx: &Transaction<'_>, op: WriteOp, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let touched = match op {
        WriteOp::PutFaculty { id, name } => tx.execute(
            "INSERT INTO faculties (id, name, stale, discovered_at) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, stale = 0",
            params![id, name, now],
        )?,
        WriteOp::PutGroup {
            id,
            name,
            faculty_id,
        } => {
            if !row_exists(tx, "faculties", faculty_id)? {
                return Err(StoreError::ForeignKey {
                    kind: EntityKind::Faculty,
                    id: faculty_id,
                });
            }
            tx.execute(
                "INSERT INTO study_groups (id, name, faculty_id, stale, discovered_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, stale = 0",
                params![id, name, faculty_id, now],
            )?
        }
        WriteOp::PutTeacher { id, name } => tx.execute(
            "INSERT INTO teachers (id, name, stale, discovered_at) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, stale = 0",
            params![id, name, now],
        )?,
        WriteOp::MarkStale { kind, id } => tx.execute(
            &format!("UPDATE {} SET stale = 1 WHERE id = ?1", table_for(kind)?),
            params![id],
        )?,
        WriteOp::DeleteFaculty { id } => {
            tx.execute("DELETE FROM faculties WHERE id = ?1", params![id])?
        }
        WriteOp::DeleteGroup { id } => {
            tx.execute("DELETE FROM study_groups WHERE id = ?1", params![id])?
        }
        WriteOp::DeleteTeacher { id } => {
            tx.execute("DELETE FROM teachers WHERE id = ?1", params![id])?
        }
        WriteOp::InsertLesson { id, content } => {
            if !row_exists(tx, "study_groups", content.group_id)? {
                return Err(StoreError::ForeignKey {
                    kind: EntityKind::Group,
                    id: content.group_id,
                });
            }
            if !row_exists(tx, "teachers", content.teacher_id)? {
                return Err(StoreError::ForeignKey {
                    kind: EntityKind::Teacher,
                    id: content.teacher_id,
                });
            }
            tx.execute(
                &format!(
                    "INSERT INTO lessons ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    LESSON_COLUMNS
                ),
                params![
                    id.to_string(),
                    content.group_id,
                    content.teacher_id,
                    content.num,
                    content.auditory,
                    content.kind,
                    content.subgroup,
                    content.subject,
                    content.begin,
                    content.end,
                    content.dow,
                    content.week_num,
                    now,
                ],
            )?
        }
        WriteOp::DeleteLesson { id } => {
            tx.execute("DELETE FROM lessons WHERE id = ?1", params![id.to_string()])?
        }
    };
    Ok(touched)
}

#[async_trait]
impl Storage for SqliteStore {
    async fn faculties(&self) -> Result<Vec<Faculty>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, stale, discovered_at FROM faculties ORDER BY id")?;
            let rows = stmt
                .query_map([], faculty_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn faculty(&self, id: i64) -> Result<Option<Faculty>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, stale, discovered_at FROM faculties WHERE id = ?1",
                    params![id],
                    faculty_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn groups(&self) -> Result<Vec<Group>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, faculty_id, stale, discovered_at FROM study_groups ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], group_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn groups_of_faculty(&self, faculty_id: i64) -> Result<Vec<Group>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, faculty_id, stale, discovered_at FROM study_groups
                 WHERE faculty_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![faculty_id], group_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn group(&self, id: i64) -> Result<Option<Group>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, faculty_id, stale, discovered_at FROM study_groups WHERE id = ?1",
                    params![id],
                    group_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn teachers(&self) -> Result<Vec<Teacher>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, stale, discovered_at FROM teachers ORDER BY id")?;
            let rows = stmt
                .query_map([], teacher_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn teacher(&self, id: i64) -> Result<Option<Teacher>, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, stale, discovered_at FROM teachers WHERE id = ?1",
                    params![id],
                    teacher_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn lessons_of_group(&self, group_id: i64) -> Result<Vec<Lesson>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM lessons WHERE group_id = ?1
                 ORDER BY week_num, dow, num, subgroup, id",
                LESSON_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![group_id], lesson_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(Lesson::try_from).collect()
        })
        .await
    }

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM lessons WHERE id = ?1", LESSON_COLUMNS),
                params![id.to_string()],
                lesson_from_row,
            )
            .optional()?
            .map(Lesson::try_from)
            .transpose()
        })
        .await
    }

    async fn groups_taught_by(&self, teacher_ids: &[i64]) -> Result<Vec<i64>, StoreError> {
        if teacher_ids.is_empty() {
            return Ok(Vec::new());
        }
        let teacher_ids = teacher_ids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT group_id FROM lessons WHERE teacher_id IN ({}) ORDER BY group_id",
                placeholders(teacher_ids.len())
            ))?;
            let rows = stmt
                .query_map(params_from_iter(teacher_ids.iter()), |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn teachers_in_use(&self, teacher_ids: &[i64]) -> Result<Vec<i64>, StoreError> {
        if teacher_ids.is_empty() {
            return Ok(Vec::new());
        }
        let teacher_ids = teacher_ids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT teacher_id FROM lessons WHERE teacher_id IN ({}) ORDER BY teacher_id",
                placeholders(teacher_ids.len())
            ))?;
            let rows = stmt
                .query_map(params_from_iter(teacher_ids.iter()), |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<usize, StoreError> {
        if ops.is_empty() {
            return Ok(0);
        }

        let op_count = ops.len();
        let touched = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();

                let mut touched = 0;
                for op in ops {
                    // Dropping `tx` on the error path rolls the batch back.
                    touched += apply_op(&tx, op, now)?;
                }
                tx.commit()?;
                Ok(touched)
            })
            .await?;

        debug!(ops = op_count, touched, "applied write batch");
        Ok(touched)
    }
}
