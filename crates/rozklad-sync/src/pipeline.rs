//! Dependency-ordered refresh pipeline.
//!
//! Refreshes run in the order faculties, groups, teachers, lessons. When
//! lessons reference a teacher that is not stored yet, the pipeline refreshes
//! teachers once, under the run's teacher guard, and retries the affected
//! groups once.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use rozklad_source::ScheduleSource;
use rozklad_store::{EntityKind, Storage};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{ChangeSet, GuardSet, Reconciler, SyncError};

/// Default number of groups whose lessons are fetched at once.
pub const DEFAULT_LESSON_CONCURRENCY: usize = 4;

/// Every non-empty change committed during one run.
///
/// Shared by the steps of a run so that work committed before a later step
/// fails can still be invalidated.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Mutex<Vec<ChangeSet>>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, change: ChangeSet) {
        if !change.is_empty() {
            self.entries.lock().await.push(change);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn drain(&self) -> Vec<ChangeSet> {
        std::mem::take(&mut *self.entries.lock().await)
    }
}

/// Orders and runs refresh steps against the upstream source.
pub struct RefreshPipeline {
    source: Arc<dyn ScheduleSource>,
    storage: Arc<dyn Storage>,
    reconciler: Reconciler,
    /// Serializes lesson refreshes of the same group. Entries live only while
    /// a refresh of that group is running or waiting.
    group_locks: DashMap<i64, Arc<Mutex<()>>>,
    lesson_concurrency: usize,
}

impl RefreshPipeline {
    pub fn new(
        source: Arc<dyn ScheduleSource>,
        storage: Arc<dyn Storage>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            source,
            storage,
            reconciler,
            group_locks: DashMap::new(),
            lesson_concurrency: DEFAULT_LESSON_CONCURRENCY,
        }
    }

    /// Set how many groups are refreshed concurrently.
    pub fn with_lesson_concurrency(mut self, concurrency: usize) -> Self {
        self.lesson_concurrency = concurrency.max(1);
        self
    }

    /// Refresh the faculty list. Returns the ids present upstream.
    #[tracing::instrument(skip(self, log))]
    pub async fn refresh_faculties(&self, log: &ChangeLog) -> Result<Vec<i64>, SyncError> {
        let batch = self.source.fetch_faculties().await?;
        let ids = batch.iter().map(|f| f.id).collect();
        let change = self.reconciler.reconcile_faculties(batch).await?;
        log.record(change).await;
        Ok(ids)
    }

    /// Refresh the groups of each faculty in turn. Returns the ids present
    /// upstream, across all faculties.
    #[tracing::instrument(skip(self, faculty_ids, log), fields(faculties = faculty_ids.len()))]
    pub async fn refresh_groups_for_faculties(
        &self,
        faculty_ids: &[i64],
        log: &ChangeLog,
    ) -> Result<Vec<i64>, SyncError> {
        let mut group_ids = Vec::new();
        for &faculty_id in faculty_ids {
            let batch = self.source.fetch_groups(faculty_id).await?;
            group_ids.extend(batch.iter().map(|g| g.id));
            let change = self.reconciler.reconcile_groups(faculty_id, batch).await?;
            log.record(change).await;
        }
        Ok(group_ids)
    }

    /// Refresh the teacher list.
    #[tracing::instrument(skip(self, log))]
    pub async fn refresh_teachers(&self, log: &ChangeLog) -> Result<(), SyncError> {
        let batch = self.source.fetch_teachers().await?;
        let change = self.reconciler.reconcile_teachers(batch).await?;
        log.record(change).await;
        Ok(())
    }

    /// Refresh one group's lessons, serialized with other refreshes of the
    /// same group.
    pub async fn refresh_group_lessons(
        &self,
        group_id: i64,
        log: &ChangeLog,
    ) -> Result<(), SyncError> {
        let lock = self
            .group_locks
            .entry(group_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _held = lock.lock().await;
            self.fetch_and_reconcile_lessons(group_id, log).await
        };

        // Only the map and this call still reference the lock: nobody waits
        self.group_locks
            .remove_if(&group_id, |_, entry| Arc::strong_count(entry) == 2);
        result
    }

    async fn fetch_and_reconcile_lessons(
        &self,
        group_id: i64,
        log: &ChangeLog,
    ) -> Result<(), SyncError> {
        let batch = self.source.fetch_group_lessons(group_id).await?;
        let change = self.reconciler.reconcile_lessons(group_id, batch).await?;
        log.record(change).await;
        Ok(())
    }

    /// Refresh the lessons of `group_ids`, repairing missing teachers once.
    ///
    /// The repair refreshes teachers under the teacher guard in `guards`; when
    /// another run holds it, the affected groups fail instead of refreshing
    /// teachers alongside it. Groups that fail for any other reason do not
    /// stop the rest; the first such error is returned after every group has
    /// been tried.
    #[tracing::instrument(skip(self, group_ids, log, guards), fields(groups = group_ids.len()))]
    pub async fn refresh_lessons_for_groups(
        &self,
        group_ids: &[i64],
        log: &ChangeLog,
        guards: &GuardSet,
    ) -> Result<(), SyncError> {
        let mut missing_teacher = Vec::new();
        let mut first_error = None;

        for (group_id, result) in self.lessons_pass(group_ids, log).await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_missing_teacher() => {
                    debug!(group_id, error = %e, "group needs teacher repair");
                    missing_teacher.push(group_id);
                }
                Err(e) => {
                    warn!(group_id, error = %e, "group lesson refresh failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !missing_teacher.is_empty() {
            missing_teacher.sort_unstable();
            info!(
                groups = ?missing_teacher,
                "lessons reference unknown teachers, refreshing teachers once"
            );
            if let Err(e) = guards.hold(EntityKind::Teacher).await {
                warn!(groups = ?missing_teacher, error = %e, "teacher repair skipped");
                return Err(SyncError::PipelineFailed(format!(
                    "teacher repair for groups {:?} skipped: {}",
                    missing_teacher, e
                )));
            }
            self.refresh_teachers(log).await?;

            let mut still_failing = Vec::new();
            for (group_id, result) in self.lessons_pass(&missing_teacher, log).await {
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_missing_teacher() => still_failing.push(format!("{}: {}", group_id, e)),
                    Err(e) => {
                        warn!(group_id, error = %e, "group lesson refresh failed after repair");
                        first_error.get_or_insert(e);
                    }
                }
            }

            if !still_failing.is_empty() {
                still_failing.sort();
                return Err(SyncError::PipelineFailed(format!(
                    "teachers still missing after refresh: {}",
                    still_failing.join(", ")
                )));
            }
            info!(groups = missing_teacher.len(), "teacher repair succeeded");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Refresh everything: faculties, their groups, teachers, then lessons of
    /// every current group.
    #[tracing::instrument(skip(self, log, guards))]
    pub async fn refresh_all(&self, log: &ChangeLog, guards: &GuardSet) -> Result<(), SyncError> {
        let faculty_ids = self.refresh_faculties(log).await?;
        let group_ids = self.refresh_groups_for_faculties(&faculty_ids, log).await?;
        self.refresh_teachers(log).await?;
        self.refresh_lessons_for_groups(&group_ids, log, guards).await
    }

    /// Ids of stored faculties that are not flagged stale.
    pub async fn current_faculties(&self) -> Result<Vec<i64>, SyncError> {
        Ok(self
            .storage
            .faculties()
            .await?
            .into_iter()
            .filter(|f| !f.stale)
            .map(|f| f.id)
            .collect())
    }

    /// Ids of stored groups that are not flagged stale.
    pub async fn current_groups(&self) -> Result<Vec<i64>, SyncError> {
        Ok(self
            .storage
            .groups()
            .await?
            .into_iter()
            .filter(|g| !g.stale)
            .map(|g| g.id)
            .collect())
    }

    async fn lessons_pass(
        &self,
        group_ids: &[i64],
        log: &ChangeLog,
    ) -> Vec<(i64, Result<(), SyncError>)> {
        stream::iter(group_ids.iter().copied())
            .map(|group_id| async move { (group_id, self.refresh_group_lessons(group_id, log).await) })
            .buffer_unordered(self.lesson_concurrency)
            .collect()
            .await
    }
}
