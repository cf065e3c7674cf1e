//! Upsert reconciliation of fetched batches into storage.
//!
//! Each call compares one upstream snapshot (all faculties, the groups of one
//! faculty, all teachers, or the lessons of one group) with what is stored and
//! writes only the difference, as a single atomic batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rozklad_source::{FacultyRecord, GroupRecord, LessonRecord, TeacherRecord};
use rozklad_store::{EntityKind, LessonContent, Storage, WriteOp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SyncError;

/// What happens to a stored entity that is missing from the latest snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalePolicy {
    /// Delete it, with everything it owns.
    Prune,
    /// Keep it and set its stale flag.
    #[default]
    RetainAndFlag,
}

impl FromStr for StalePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prune" => Ok(StalePolicy::Prune),
            "retain-and-flag" | "retain" => Ok(StalePolicy::RetainAndFlag),
            other => Err(format!(
                "unknown stale policy '{}', expected 'prune' or 'retain-and-flag'",
                other
            )),
        }
    }
}

impl fmt::Display for StalePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StalePolicy::Prune => f.write_str("prune"),
            StalePolicy::RetainAndFlag => f.write_str("retain-and-flag"),
        }
    }
}

/// A fetched snapshot, tagged with its scope.
#[derive(Debug, Clone)]
pub enum Batch {
    Faculties(Vec<FacultyRecord>),
    Groups {
        faculty_id: i64,
        records: Vec<GroupRecord>,
    },
    Teachers(Vec<TeacherRecord>),
    Lessons {
        group_id: i64,
        records: Vec<LessonRecord>,
    },
}

/// What one reconcile call changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub kind: EntityKind,
    /// Owning faculty for groups, owning group for lessons.
    pub scope: Option<i64>,
    /// Rows touched in storage.
    pub written: usize,
    pub added: Vec<i64>,
    pub updated: Vec<i64>,
    /// Pruned or newly flagged stale.
    pub removed: Vec<i64>,
    /// Groups deleted along with a pruned faculty.
    pub cascaded_groups: Vec<i64>,
    pub lessons_inserted: Vec<Uuid>,
    pub lessons_deleted: Vec<Uuid>,
}

impl ChangeSet {
    fn new(kind: EntityKind, scope: Option<i64>) -> Self {
        Self {
            kind,
            scope,
            written: 0,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            cascaded_groups: Vec::new(),
            lessons_inserted: Vec::new(),
            lessons_deleted: Vec::new(),
        }
    }

    /// True when the call wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.written == 0
            && self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.lessons_inserted.is_empty()
            && self.lessons_deleted.is_empty()
    }

    /// Every entity id this change touched, in order added, updated, removed.
    pub fn changed_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
    }
}

fn lesson_content(record: LessonRecord, group_id: i64) -> LessonContent {
    LessonContent {
        group_id,
        teacher_id: record.teacher_id,
        num: record.num,
        auditory: record.auditory,
        kind: record.kind,
        subgroup: record.subgroup,
        subject: record.subject,
        begin: record.begin,
        end: record.end,
        dow: record.dow,
        week_num: record.week_num,
    }
}

/// A named entity as far as the reconciler cares.
struct Named {
    name: String,
    stale: bool,
}

/// Merges fetched batches into storage.
#[derive(Clone)]
pub struct Reconciler {
    storage: Arc<dyn Storage>,
    policy: StalePolicy,
}

impl Reconciler {
    pub fn new(storage: Arc<dyn Storage>, policy: StalePolicy) -> Self {
        Self { storage, policy }
    }

    pub fn policy(&self) -> StalePolicy {
        self.policy
    }

    /// Reconcile any batch.
    pub async fn reconcile(&self, batch: Batch) -> Result<ChangeSet, SyncError> {
        match batch {
            Batch::Faculties(records) => self.reconcile_faculties(records).await,
            Batch::Groups {
                faculty_id,
                records,
            } => self.reconcile_groups(faculty_id, records).await,
            Batch::Teachers(records) => self.reconcile_teachers(records).await,
            Batch::Lessons { group_id, records } => {
                self.reconcile_lessons(group_id, records).await
            }
        }
    }

    /// Reconcile the full faculty list.
    #[tracing::instrument(skip(self, batch), fields(count = batch.len()))]
    pub async fn reconcile_faculties(
        &self,
        batch: Vec<FacultyRecord>,
    ) -> Result<ChangeSet, SyncError> {
        let stored: BTreeMap<i64, Named> = self
            .storage
            .faculties()
            .await?
            .into_iter()
            .map(|f| (f.id, Named { name: f.name, stale: f.stale }))
            .collect();
        let incoming = dedup_by_id(
            EntityKind::Faculty,
            batch.into_iter().map(|r| (r.id, r.name)),
        );

        let mut changes = ChangeSet::new(EntityKind::Faculty, None);
        let mut ops = Vec::new();
        diff_named(&stored, &incoming, &mut changes, |id, name| {
            ops.push(WriteOp::PutFaculty { id, name })
        });

        for id in self.absent(&stored, &incoming, EntityKind::Faculty) {
            match self.policy {
                StalePolicy::Prune => {
                    for group in self.storage.groups_of_faculty(id).await? {
                        changes.cascaded_groups.push(group.id);
                    }
                    ops.push(WriteOp::DeleteFaculty { id });
                    changes.removed.push(id);
                }
                StalePolicy::RetainAndFlag => {
                    if stored.get(&id).is_some_and(|f| !f.stale) {
                        ops.push(WriteOp::MarkStale {
                            kind: EntityKind::Faculty,
                            id,
                        });
                        changes.removed.push(id);
                    }
                }
            }
        }

        self.commit(ops, changes).await
    }

    /// Reconcile the group list of one faculty.
    #[tracing::instrument(skip(self, batch), fields(count = batch.len()))]
    pub async fn reconcile_groups(
        &self,
        faculty_id: i64,
        batch: Vec<GroupRecord>,
    ) -> Result<ChangeSet, SyncError> {
        if self.storage.faculty(faculty_id).await?.is_none() {
            return Err(SyncError::MissingDependency {
                kind: EntityKind::Faculty,
                id: faculty_id,
            });
        }

        let stored: BTreeMap<i64, Named> = self
            .storage
            .groups_of_faculty(faculty_id)
            .await?
            .into_iter()
            .map(|g| (g.id, Named { name: g.name, stale: g.stale }))
            .collect();

        for record in &batch {
            if record.faculty_id != faculty_id {
                return Err(SyncError::OwnerChanged {
                    group_id: record.id,
                    from: faculty_id,
                    to: record.faculty_id,
                });
            }
            if !stored.contains_key(&record.id)
                && let Some(existing) = self.storage.group(record.id).await?
            {
                return Err(SyncError::OwnerChanged {
                    group_id: record.id,
                    from: existing.faculty_id,
                    to: faculty_id,
                });
            }
        }

        let incoming = dedup_by_id(
            EntityKind::Group,
            batch.into_iter().map(|r| (r.id, r.name)),
        );

        let mut changes = ChangeSet::new(EntityKind::Group, Some(faculty_id));
        let mut ops = Vec::new();
        diff_named(&stored, &incoming, &mut changes, |id, name| {
            ops.push(WriteOp::PutGroup {
                id,
                name,
                faculty_id,
            })
        });

        for id in self.absent(&stored, &incoming, EntityKind::Group) {
            match self.policy {
                StalePolicy::Prune => {
                    ops.push(WriteOp::DeleteGroup { id });
                    changes.removed.push(id);
                }
                StalePolicy::RetainAndFlag => {
                    if stored.get(&id).is_some_and(|g| !g.stale) {
                        ops.push(WriteOp::MarkStale {
                            kind: EntityKind::Group,
                            id,
                        });
                        changes.removed.push(id);
                    }
                }
            }
        }

        self.commit(ops, changes).await
    }

    /// Reconcile the full teacher list.
    ///
    /// A teacher that lessons still reference is flagged stale even under
    /// [`StalePolicy::Prune`].
    #[tracing::instrument(skip(self, batch), fields(count = batch.len()))]
    pub async fn reconcile_teachers(
        &self,
        batch: Vec<TeacherRecord>,
    ) -> Result<ChangeSet, SyncError> {
        let stored: BTreeMap<i64, Named> = self
            .storage
            .teachers()
            .await?
            .into_iter()
            .map(|t| (t.id, Named { name: t.name, stale: t.stale }))
            .collect();
        let incoming = dedup_by_id(
            EntityKind::Teacher,
            batch.into_iter().map(|r| (r.id, r.name)),
        );

        let mut changes = ChangeSet::new(EntityKind::Teacher, None);
        let mut ops = Vec::new();
        diff_named(&stored, &incoming, &mut changes, |id, name| {
            ops.push(WriteOp::PutTeacher { id, name })
        });

        let absent = self.absent(&stored, &incoming, EntityKind::Teacher);
        let in_use: BTreeSet<i64> = match self.policy {
            StalePolicy::Prune if !absent.is_empty() => self
                .storage
                .teachers_in_use(&absent)
                .await?
                .into_iter()
                .collect(),
            _ => BTreeSet::new(),
        };

        for id in absent {
            let already_stale = stored.get(&id).is_some_and(|t| t.stale);
            if self.policy == StalePolicy::Prune && !in_use.contains(&id) {
                ops.push(WriteOp::DeleteTeacher { id });
                changes.removed.push(id);
            } else if !already_stale {
                ops.push(WriteOp::MarkStale {
                    kind: EntityKind::Teacher,
                    id,
                });
                changes.removed.push(id);
            }
        }

        self.commit(ops, changes).await
    }

    /// Reconcile the lessons of one group.
    ///
    /// Lessons have no upstream identity, so they are matched by content: an
    /// incoming lesson equal to a stored one keeps the stored row, leftovers on
    /// either side are inserted or deleted. Matching counts duplicates.
    #[tracing::instrument(skip(self, batch), fields(count = batch.len()))]
    pub async fn reconcile_lessons(
        &self,
        group_id: i64,
        batch: Vec<LessonRecord>,
    ) -> Result<ChangeSet, SyncError> {
        if self.storage.group(group_id).await?.is_none() {
            return Err(SyncError::MissingDependency {
                kind: EntityKind::Group,
                id: group_id,
            });
        }

        let teacher_ids: BTreeSet<i64> = batch.iter().map(|r| r.teacher_id).collect();
        for teacher_id in teacher_ids {
            if self.storage.teacher(teacher_id).await?.is_none() {
                debug!(group_id, teacher_id, "lesson references unknown teacher");
                return Err(SyncError::MissingDependency {
                    kind: EntityKind::Teacher,
                    id: teacher_id,
                });
            }
        }

        let mut existing: HashMap<LessonContent, Vec<Uuid>> = HashMap::new();
        for lesson in self.storage.lessons_of_group(group_id).await? {
            existing.entry(lesson.content).or_default().push(lesson.id);
        }

        let mut changes = ChangeSet::new(EntityKind::Lesson, Some(group_id));
        let mut inserts = Vec::new();
        for record in batch {
            let content = lesson_content(record, group_id);
            let matched = existing.get_mut(&content).and_then(Vec::pop);
            if matched.is_none() {
                let id = Uuid::new_v4();
                changes.lessons_inserted.push(id);
                inserts.push(WriteOp::InsertLesson { id, content });
            }
        }

        let mut ops: Vec<WriteOp> = existing
            .into_values()
            .flatten()
            .map(|id| {
                changes.lessons_deleted.push(id);
                WriteOp::DeleteLesson { id }
            })
            .collect();
        ops.extend(inserts);

        self.commit(ops, changes).await
    }

    /// Stored ids missing from the snapshot. An empty snapshot never makes
    /// anything stale.
    fn absent(
        &self,
        stored: &BTreeMap<i64, Named>,
        incoming: &BTreeMap<i64, String>,
        kind: EntityKind,
    ) -> Vec<i64> {
        if incoming.is_empty() && !stored.is_empty() {
            warn!(%kind, stored = stored.len(), "empty upstream snapshot, skipping stale handling");
            return Vec::new();
        }
        stored
            .keys()
            .filter(|id| !incoming.contains_key(id))
            .copied()
            .collect()
    }

    async fn commit(
        &self,
        ops: Vec<WriteOp>,
        mut changes: ChangeSet,
    ) -> Result<ChangeSet, SyncError> {
        if ops.is_empty() {
            debug!(kind = %changes.kind, scope = ?changes.scope, "nothing to write");
            return Ok(changes);
        }

        changes.written = self.storage.apply(ops).await?;
        info!(
            kind = %changes.kind,
            scope = ?changes.scope,
            written = changes.written,
            added = changes.added.len() + changes.lessons_inserted.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len() + changes.lessons_deleted.len(),
            policy = %self.policy,
            "reconciled batch"
        );
        Ok(changes)
    }
}

/// Collapse repeated ids in a snapshot; the last occurrence wins.
fn dedup_by_id(
    kind: EntityKind,
    records: impl Iterator<Item = (i64, String)>,
) -> BTreeMap<i64, String> {
    let mut out = BTreeMap::new();
    for (id, name) in records {
        if out.insert(id, name).is_some() {
            warn!(%kind, id, "duplicate id in upstream snapshot");
        }
    }
    out
}

/// Emit puts for new and changed entities and record them.
fn diff_named(
    stored: &BTreeMap<i64, Named>,
    incoming: &BTreeMap<i64, String>,
    changes: &mut ChangeSet,
    mut put: impl FnMut(i64, String),
) {
    for (id, name) in incoming {
        match stored.get(id) {
            None => {
                changes.added.push(*id);
                put(*id, name.clone());
            }
            Some(existing) if existing.name != *name || existing.stale => {
                changes.updated.push(*id);
                put(*id, name.clone());
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rozklad_store::SqliteStore;
    use test_case::test_case;

    fn faculty(id: i64, name: &str) -> FacultyRecord {
        FacultyRecord {
            id,
            name: name.to_string(),
        }
    }

    fn group(id: i64, name: &str, faculty_id: i64) -> GroupRecord {
        GroupRecord {
            id,
            name: name.to_string(),
            faculty_id,
        }
    }

    fn teacher(id: i64, name: &str) -> TeacherRecord {
        TeacherRecord {
            id,
            name: name.to_string(),
        }
    }

    fn lesson(num: i64, teacher_id: i64, subject: &str) -> LessonRecord {
        LessonRecord {
            num,
            auditory: "1-101".to_string(),
            kind: "Лек".to_string(),
            subgroup: 0,
            subject: subject.to_string(),
            teacher_id,
            begin: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            end: NaiveTime::from_hms_opt(9, 50, 0).unwrap(),
            dow: "Пн".to_string(),
            week_num: 1,
        }
    }

    fn reconciler(policy: StalePolicy) -> (Arc<SqliteStore>, Reconciler) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let reconciler = Reconciler::new(store.clone(), policy);
        (store, reconciler)
    }

    async fn seed(reconciler: &Reconciler) {
        reconciler
            .reconcile_faculties(vec![faculty(1, "Engineering"), faculty(2, "Economics")])
            .await
            .unwrap();
        reconciler
            .reconcile_groups(1, vec![group(10, "CS-101", 1), group(11, "CS-102", 1)])
            .await
            .unwrap();
        reconciler
            .reconcile_teachers(vec![teacher(7, "A. Ivanov"), teacher(8, "B. Petrenko")])
            .await
            .unwrap();
    }

    #[test_case("prune", StalePolicy::Prune)]
    #[test_case("retain-and-flag", StalePolicy::RetainAndFlag)]
    #[test_case("retain", StalePolicy::RetainAndFlag)]
    fn test_parse_stale_policy(raw: &str, expected: StalePolicy) {
        assert_eq!(raw.parse::<StalePolicy>().unwrap(), expected);
    }

    #[test]
    fn test_default_policy_retains() {
        assert_eq!(StalePolicy::default(), StalePolicy::RetainAndFlag);
        assert!("delete".parse::<StalePolicy>().is_err());
    }

    #[tokio::test]
    async fn test_faculties_added_then_idempotent() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        let batch = vec![faculty(1, "Engineering"), faculty(2, "Economics")];

        let first = reconciler.reconcile_faculties(batch.clone()).await.unwrap();
        assert_eq!(first.added, vec![1, 2]);
        assert_eq!(first.written, 2);

        let second = reconciler.reconcile_faculties(batch).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.faculties().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_is_update() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        reconciler
            .reconcile_faculties(vec![faculty(1, "Engineering")])
            .await
            .unwrap();
        let changes = reconciler
            .reconcile_faculties(vec![faculty(1, "Faculty of Engineering")])
            .await
            .unwrap();
        assert_eq!(changes.updated, vec![1]);
        assert_eq!(
            store.faculty(1).await.unwrap().unwrap().name,
            "Faculty of Engineering"
        );
    }

    #[tokio::test]
    async fn test_groups_need_stored_faculty() {
        let (_store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        let err = reconciler
            .reconcile_groups(99, vec![group(10, "CS-101", 99)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::MissingDependency {
                kind: EntityKind::Faculty,
                id: 99
            }
        ));
    }

    #[tokio::test]
    async fn test_group_cannot_change_faculty() {
        let (_store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;
        let err = reconciler
            .reconcile_groups(2, vec![group(10, "CS-101", 2)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::OwnerChanged {
                group_id: 10,
                from: 1,
                to: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_retain_flags_absent_group_once() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;

        let changes = reconciler
            .reconcile_groups(1, vec![group(10, "CS-101", 1)])
            .await
            .unwrap();
        assert_eq!(changes.removed, vec![11]);
        assert!(store.group(11).await.unwrap().unwrap().stale);

        let again = reconciler
            .reconcile_groups(1, vec![group(10, "CS-101", 1)])
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_reappearing_entity_is_revived() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;
        reconciler
            .reconcile_groups(1, vec![group(10, "CS-101", 1)])
            .await
            .unwrap();

        let changes = reconciler
            .reconcile_groups(1, vec![group(10, "CS-101", 1), group(11, "CS-102", 1)])
            .await
            .unwrap();
        assert_eq!(changes.updated, vec![11]);
        assert!(!store.group(11).await.unwrap().unwrap().stale);
    }

    #[tokio::test]
    async fn test_prune_faculty_cascades() {
        let (store, reconciler) = reconciler(StalePolicy::Prune);
        seed(&reconciler).await;
        reconciler
            .reconcile_lessons(10, vec![lesson(1, 7, "Algebra")])
            .await
            .unwrap();

        let changes = reconciler
            .reconcile_faculties(vec![faculty(2, "Economics")])
            .await
            .unwrap();
        assert_eq!(changes.removed, vec![1]);
        assert_eq!(changes.cascaded_groups, vec![10, 11]);
        assert!(store.group(10).await.unwrap().is_none());
        assert!(store.lessons_of_group(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_referenced_teacher_flagged() {
        let (store, reconciler) = reconciler(StalePolicy::Prune);
        seed(&reconciler).await;
        reconciler
            .reconcile_lessons(10, vec![lesson(1, 7, "Algebra")])
            .await
            .unwrap();

        let changes = reconciler
            .reconcile_teachers(vec![teacher(9, "C. Shevchenko")])
            .await
            .unwrap();
        assert_eq!(changes.added, vec![9]);
        assert_eq!(changes.removed, vec![7, 8]);
        assert!(store.teacher(7).await.unwrap().unwrap().stale);
        assert!(store.teacher(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_snapshot_marks_nothing() {
        let (store, reconciler) = reconciler(StalePolicy::Prune);
        seed(&reconciler).await;
        let changes = reconciler.reconcile_teachers(Vec::new()).await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.teachers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lessons_need_stored_teacher() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;
        let err = reconciler
            .reconcile_lessons(10, vec![lesson(1, 7, "Algebra"), lesson(2, 42, "Physics")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::MissingDependency {
                kind: EntityKind::Teacher,
                id: 42
            }
        ));
        assert!(store.lessons_of_group(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lessons_need_stored_group() {
        let (_store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;
        let err = reconciler
            .reconcile_lessons(404, vec![lesson(1, 7, "Algebra")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::MissingDependency {
                kind: EntityKind::Group,
                id: 404
            }
        ));
    }

    #[tokio::test]
    async fn test_lessons_diff_by_content() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;

        let first = reconciler
            .reconcile_lessons(10, vec![lesson(1, 7, "Algebra"), lesson(2, 8, "Physics")])
            .await
            .unwrap();
        assert_eq!(first.lessons_inserted.len(), 2);
        let kept = store
            .lessons_of_group(10)
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.content.subject == "Algebra")
            .unwrap();

        let second = reconciler
            .reconcile_lessons(10, vec![lesson(1, 7, "Algebra"), lesson(3, 8, "Chemistry")])
            .await
            .unwrap();
        assert_eq!(second.lessons_inserted.len(), 1);
        assert_eq!(second.lessons_deleted.len(), 1);

        // The unchanged lesson keeps its row
        let stored = store.lessons_of_group(10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|l| l.id == kept.id));
    }

    #[tokio::test]
    async fn test_duplicate_lessons_not_multiplied() {
        let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        seed(&reconciler).await;
        let batch = vec![lesson(1, 7, "Lab"), lesson(1, 7, "Lab")];

        reconciler.reconcile_lessons(10, batch.clone()).await.unwrap();
        let again = reconciler.reconcile_lessons(10, batch).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.lessons_of_group(10).await.unwrap().len(), 2);

        // Dropping one duplicate removes exactly one row
        let changes = reconciler
            .reconcile_lessons(10, vec![lesson(1, 7, "Lab")])
            .await
            .unwrap();
        assert_eq!(changes.lessons_deleted.len(), 1);
        assert_eq!(store.lessons_of_group(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_dispatches_by_batch() {
        let (_store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
        let changes = reconciler
            .reconcile(Batch::Faculties(vec![faculty(1, "Engineering")]))
            .await
            .unwrap();
        assert_eq!(changes.kind, EntityKind::Faculty);
        let changes = reconciler
            .reconcile(Batch::Groups {
                faculty_id: 1,
                records: vec![group(10, "CS-101", 1)],
            })
            .await
            .unwrap();
        assert_eq!(changes.kind, EntityKind::Group);
        assert_eq!(changes.scope, Some(1));
    }

    // === Property-Based Tests ===

    fn arb_lesson() -> impl Strategy<Value = LessonRecord> {
        (1i64..4, prop::sample::select(vec![7i64, 8]), prop::sample::select(vec!["Algebra", "Physics"]), 0i64..3, 1i64..3)
            .prop_map(|(num, teacher_id, subject, subgroup, week_num)| LessonRecord {
                subgroup,
                week_num,
                ..lesson(num, teacher_id, subject)
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Stored lessons always equal the last batch as a multiset, and
        // repeating that batch writes nothing
        #[test]
        fn lessons_converge_and_are_idempotent(
            first in prop::collection::vec(arb_lesson(), 0..12),
            second in prop::collection::vec(arb_lesson(), 0..12),
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let (store, reconciler) = reconciler(StalePolicy::RetainAndFlag);
                seed(&reconciler).await;

                reconciler.reconcile_lessons(10, first).await.unwrap();
                reconciler.reconcile_lessons(10, second.clone()).await.unwrap();

                let mut stored: Vec<_> = store
                    .lessons_of_group(10)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|l| l.content)
                    .collect();
                let mut expected: Vec<_> = second
                    .iter()
                    .cloned()
                    .map(|r| lesson_content(r, 10))
                    .collect();
                stored.sort();
                expected.sort();
                assert_eq!(stored, expected);

                let repeat = reconciler.reconcile_lessons(10, second).await.unwrap();
                assert!(repeat.is_empty());
            });
        }
    }
}
