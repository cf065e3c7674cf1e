//! Orchestrator: runs refresh operations for the scheduler and for
//! on-demand callers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rozklad_scheduler::{Scheduler, TaskExecutor, TaskOutcome};
use rozklad_source::SourceError;
use rozklad_store::{EntityKind, Storage};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{CacheInvalidator, ChangeLog, GuardSet, RefreshPipeline, SyncError};

/// Default lifetime of a refresh guard.
pub const DEFAULT_GUARD_TTL: Duration = Duration::from_secs(15 * 60);

/// A refresh operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOp {
    Faculties,
    /// Groups of every current faculty.
    Groups,
    Teachers,
    /// Lessons of every current group.
    Lessons,
    /// Lessons of one group.
    GroupLessons(i64),
    /// Everything, in dependency order.
    Everything,
}

impl RefreshOp {
    /// Operations that have a scheduled task of their own.
    pub const SCHEDULED: [RefreshOp; 4] = [
        RefreshOp::Faculties,
        RefreshOp::Groups,
        RefreshOp::Teachers,
        RefreshOp::Lessons,
    ];

    /// Name used in logs and responses.
    pub fn scope(&self) -> String {
        match self {
            RefreshOp::GroupLessons(group_id) => format!("group:{}", group_id),
            other => other.task_name().unwrap_or("everything").to_string(),
        }
    }

    /// The scheduler task driving this operation, if any.
    pub fn task_name(&self) -> Option<&'static str> {
        match self {
            RefreshOp::Faculties => Some("faculties"),
            RefreshOp::Groups => Some("groups"),
            RefreshOp::Teachers => Some("teachers"),
            RefreshOp::Lessons => Some("lessons"),
            RefreshOp::GroupLessons(_) | RefreshOp::Everything => None,
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::SCHEDULED
            .into_iter()
            .find(|op| op.task_name() == Some(name))
    }

    /// Entity kinds whose whole-table guard the operation holds for its
    /// entire run. A single group is serialized by the pipeline instead.
    pub fn guarded_kinds(&self) -> &'static [EntityKind] {
        match self {
            RefreshOp::Faculties => &[EntityKind::Faculty],
            RefreshOp::Groups => &[EntityKind::Group],
            RefreshOp::Teachers => &[EntityKind::Teacher],
            RefreshOp::Lessons => &[EntityKind::Lesson],
            RefreshOp::GroupLessons(_) => &[],
            RefreshOp::Everything => &[
                EntityKind::Faculty,
                EntityKind::Group,
                EntityKind::Teacher,
                EntityKind::Lesson,
            ],
        }
    }
}

/// Parses `faculties`, `groups`, `teachers`, `lessons`, `all` and
/// `group:<id>`.
impl FromStr for RefreshOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(op) = Self::from_task_name(s) {
            return Ok(op);
        }
        match s {
            "all" | "everything" => Ok(RefreshOp::Everything),
            _ => s
                .strip_prefix("group:")
                .and_then(|id| id.parse().ok())
                .map(RefreshOp::GroupLessons)
                .ok_or_else(|| format!("unknown refresh scope '{}'", s)),
        }
    }
}

impl fmt::Display for RefreshOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope())
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub op: RefreshOp,
    /// Reconcile calls that wrote something.
    pub changes: usize,
    pub rows_written: usize,
    pub keys_invalidated: usize,
    pub elapsed: Duration,
}

/// Result of an on-demand refresh, as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated { rows_written: usize },
    NotFound,
    AlreadyInProgress { retry_after: Duration },
    UpstreamError { message: String },
}

/// Runs refresh operations and keeps the cache and the scheduler informed.
pub struct Orchestrator {
    pipeline: RefreshPipeline,
    invalidator: CacheInvalidator,
    storage: Arc<dyn Storage>,
    scheduler: Option<Scheduler>,
    guard_ttl: Duration,
}

impl Orchestrator {
    pub fn new(
        pipeline: RefreshPipeline,
        invalidator: CacheInvalidator,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            pipeline,
            invalidator,
            storage,
            scheduler: None,
            guard_ttl: DEFAULT_GUARD_TTL,
        }
    }

    /// Report on-demand outcomes to this scheduler.
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_guard_ttl(mut self, ttl: Duration) -> Self {
        self.guard_ttl = ttl;
        self
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    /// Run one operation.
    ///
    /// The guards of every kind the operation refreshes are taken up front,
    /// all or none. Cache keys are invalidated for every change committed
    /// during the run, including the part of a run that failed later.
    #[tracing::instrument(skip(self, op), fields(op = %op))]
    pub async fn execute(&self, op: RefreshOp) -> Result<RunSummary, SyncError> {
        let guards = GuardSet::new(self.invalidator.clone(), self.guard_ttl);
        guards.hold_all(op.guarded_kinds()).await?;

        let started = Instant::now();
        let log = ChangeLog::new();
        let result = self.run_op(op, &log, &guards).await;

        let changes = log.drain().await;
        let keys_invalidated = match self.invalidator.invalidate_changes(&changes).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "failed to compute cache keys, run changes may be served stale");
                0
            }
        };

        guards.release_all().await;

        let summary = RunSummary {
            op,
            changes: changes.len(),
            rows_written: changes.iter().map(|c| c.written).sum(),
            keys_invalidated,
            elapsed: started.elapsed(),
        };

        match result {
            Ok(()) => {
                info!(
                    changes = summary.changes,
                    rows_written = summary.rows_written,
                    keys_invalidated = summary.keys_invalidated,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "refresh completed"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    committed_changes = summary.changes,
                    keys_invalidated = summary.keys_invalidated,
                    "refresh failed"
                );
                Err(e)
            }
        }
    }

    /// Run an operation for the scheduler.
    pub async fn run_scheduled(&self, op: RefreshOp) -> TaskOutcome {
        to_task_outcome(&self.execute(op).await)
    }

    /// Run an operation for an on-demand caller and report the outcome to
    /// the operation's scheduler task.
    pub async fn refresh(&self, op: RefreshOp) -> RefreshOutcome {
        if let RefreshOp::GroupLessons(group_id) = op {
            match self.storage.group(group_id).await {
                Ok(Some(_)) => {}
                Ok(None) => return RefreshOutcome::NotFound,
                Err(e) => {
                    error!(group_id, error = %e, "group lookup failed");
                    return RefreshOutcome::UpstreamError {
                        message: "storage unavailable".to_string(),
                    };
                }
            }
        }

        let result = self.execute(op).await;

        if let (Some(scheduler), Some(task)) = (&self.scheduler, op.task_name()) {
            let outcome = to_task_outcome(&result);
            if !matches!(outcome, TaskOutcome::Skipped(_))
                && let Err(e) = scheduler.record_outcome(task, outcome).await
            {
                debug!(task, error = %e, "on-demand outcome not recorded");
            }
        }

        match result {
            Ok(summary) => RefreshOutcome::Updated {
                rows_written: summary.rows_written,
            },
            Err(e) => client_outcome(op, e),
        }
    }

    async fn run_op(
        &self,
        op: RefreshOp,
        log: &ChangeLog,
        guards: &GuardSet,
    ) -> Result<(), SyncError> {
        match op {
            RefreshOp::Faculties => self.pipeline.refresh_faculties(log).await.map(drop),
            RefreshOp::Groups => {
                let faculties = self.pipeline.current_faculties().await?;
                self.pipeline
                    .refresh_groups_for_faculties(&faculties, log)
                    .await
                    .map(drop)
            }
            RefreshOp::Teachers => self.pipeline.refresh_teachers(log).await,
            RefreshOp::Lessons => {
                let groups = self.pipeline.current_groups().await?;
                self.pipeline
                    .refresh_lessons_for_groups(&groups, log, guards)
                    .await
            }
            RefreshOp::GroupLessons(group_id) => {
                self.pipeline
                    .refresh_lessons_for_groups(&[group_id], log, guards)
                    .await
            }
            RefreshOp::Everything => self.pipeline.refresh_all(log, guards).await,
        }
    }
}

/// What an on-demand caller is told about a failed run. Only the upstream
/// failure kind is passed on; everything else is logged and summarized.
fn client_outcome(op: RefreshOp, err: SyncError) -> RefreshOutcome {
    let message = match err {
        SyncError::GuardAlreadyHeld { retry_after } => {
            return RefreshOutcome::AlreadyInProgress { retry_after };
        }
        SyncError::MissingDependency {
            kind: EntityKind::Group,
            id,
        } if op == RefreshOp::GroupLessons(id) => return RefreshOutcome::NotFound,
        SyncError::Source(source) => match source {
            SourceError::Unavailable(_) => "upstream schedule service is unavailable".to_string(),
            SourceError::UnexpectedStatus(status) => {
                format!("upstream schedule service answered with status {}", status)
            }
            SourceError::Decode(_) => {
                "upstream schedule service sent a malformed response".to_string()
            }
        },
        SyncError::PipelineFailed(ref detail) => {
            warn!(op = %op, detail = %detail, "on-demand refresh incomplete");
            "refresh incomplete, upstream data references unknown entities".to_string()
        }
        conflict @ (SyncError::MissingDependency { .. } | SyncError::OwnerChanged { .. }) => {
            warn!(op = %op, error = %conflict, "upstream data conflicts with the mirror");
            "upstream data conflicts with the stored schedule".to_string()
        }
        SyncError::Storage(ref e) => {
            error!(op = %op, error = %e, "storage failed during on-demand refresh");
            "internal error while storing the schedule".to_string()
        }
    };
    RefreshOutcome::UpstreamError { message }
}

fn to_task_outcome(result: &Result<RunSummary, SyncError>) -> TaskOutcome {
    match result {
        Ok(_) => TaskOutcome::Succeeded,
        Err(SyncError::GuardAlreadyHeld { retry_after }) => TaskOutcome::Skipped(format!(
            "refresh in progress elsewhere, guard expires in {}s",
            retry_after.as_secs()
        )),
        Err(e) => TaskOutcome::Failed(e.to_string()),
    }
}

/// Scheduler executor that maps task names to refresh operations.
pub fn scheduled_executor(orchestrator: Arc<Orchestrator>) -> TaskExecutor {
    Arc::new(move |name, trigger| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match RefreshOp::from_task_name(&name) {
                Some(op) => {
                    debug!(task = %name, ?trigger, "running scheduled refresh");
                    orchestrator.run_scheduled(op).await
                }
                None => TaskOutcome::Failed(format!("no refresh operation for task '{}'", name)),
            }
        })
    })
}
