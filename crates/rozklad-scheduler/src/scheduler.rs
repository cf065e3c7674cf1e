//! Task scheduler implementation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{EscalationState, SchedulerError, Task, TaskOutcome, TaskSpec, Trigger};

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep duration between scheduler checks.
const MAX_SLEEP_SECS: u64 = 60;

/// Type alias for the task executor function.
pub type TaskExecutor = Arc<
    dyn Fn(String, Trigger) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send>> + Send + Sync,
>;

/// The task scheduler.
///
/// Cloning is cheap; clones share the same task table.
#[derive(Clone, Default)]
pub struct Scheduler {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with its main and optional retry cadence.
    pub async fn register(&self, spec: TaskSpec) -> Result<(), SchedulerError> {
        self.register_at(spec, Utc::now()).await
    }

    /// Register a task as of `now`.
    #[tracing::instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn register_at(
        &self,
        spec: TaskSpec,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&spec.name) {
            return Err(SchedulerError::TaskExists(spec.name));
        }

        let task = Task::from_spec(spec, now)?;
        info!(
            name = %task.name,
            main = %task.main.cadence,
            retry = ?task.retry.as_ref().map(|r| r.cadence.to_string()),
            next_fire = %task.main.next_fire,
            "registered task"
        );
        tasks.insert(task.name.clone(), task);
        Ok(())
    }

    /// Get a task by name.
    pub async fn task(&self, name: &str) -> Option<Task> {
        self.tasks.read().await.get(name).cloned()
    }

    /// List all tasks, ordered by name.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Take every due task as of `now` and mark it running.
    ///
    /// A running task is not returned again until its outcome is recorded.
    pub async fn take_due_at(&self, now: DateTime<Utc>) -> Vec<(String, Trigger)> {
        let mut tasks = self.tasks.write().await;
        let mut due = Vec::new();

        for task in tasks.values_mut() {
            if let Some(trigger) = task.due_trigger(now) {
                task.start(now);
                due.push((task.name.clone(), trigger));
            }
        }

        due.sort();
        due
    }

    /// Record the outcome of a run and return the resulting escalation state.
    ///
    /// Used by on-demand callers; a scheduled run of the same task stays
    /// marked running.
    pub async fn record_outcome(
        &self,
        name: &str,
        outcome: TaskOutcome,
    ) -> Result<EscalationState, SchedulerError> {
        self.record_outcome_at(name, outcome, Utc::now()).await
    }

    /// Record the outcome of a run as of `now`.
    pub async fn record_outcome_at(
        &self,
        name: &str,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<EscalationState, SchedulerError> {
        self.apply_outcome(name, outcome, now, false).await
    }

    /// Record the outcome of a run handed out by [`Scheduler::take_due_at`]
    /// and make the task dispatchable again.
    pub async fn finish_at(
        &self,
        name: &str,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<EscalationState, SchedulerError> {
        self.apply_outcome(name, outcome, now, true).await
    }

    async fn apply_outcome(
        &self,
        name: &str,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
        finished: bool,
    ) -> Result<EscalationState, SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::TaskNotFound(name.to_string()))?;

        let before = task.state;
        if finished {
            task.running = false;
        }
        task.observe(&outcome, now);

        match (&outcome, before, task.state) {
            (TaskOutcome::Failed(error), EscalationState::Idle, EscalationState::Retrying) => {
                warn!(
                    name,
                    error = %error,
                    next_retry = ?task.retry.as_ref().map(|r| r.next_fire),
                    "task failed, retry cadence armed"
                );
            }
            (TaskOutcome::Failed(error), _, _) => {
                warn!(
                    name,
                    error = %error,
                    failure_count = task.failure_count,
                    "task failed again"
                );
            }
            (TaskOutcome::Succeeded, EscalationState::Retrying, EscalationState::Idle) => {
                info!(name, "task recovered, retry cadence paused");
            }
            (TaskOutcome::Succeeded, _, _) => {
                debug!(name, next_fire = %task.main.next_fire, "task succeeded");
            }
            (TaskOutcome::Skipped(reason), _, _) => {
                debug!(name, reason = %reason, "task skipped");
            }
        }

        Ok(task.state)
    }

    /// Calculate how long to sleep until the next timer fires.
    pub async fn calculate_sleep_duration(&self) -> std::time::Duration {
        self.calculate_sleep_duration_at(Utc::now()).await
    }

    pub async fn calculate_sleep_duration_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        let tasks = self.tasks.read().await;

        let next_due = tasks
            .values()
            .filter(|t| !t.running)
            .map(Task::next_fire)
            .min();

        let secs = match next_due {
            Some(next) => {
                let diff = (next - now).num_seconds();
                (diff.max(MIN_SLEEP_SECS as i64) as u64).min(MAX_SLEEP_SECS)
            }
            None => MAX_SLEEP_SECS,
        };

        std::time::Duration::from_secs(secs)
    }

    /// Run the scheduler loop until shutdown is signalled.
    ///
    /// Each due task runs on its own spawned future, so a slow run never
    /// delays another task's timer. In-flight runs are awaited before return.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>, executor: TaskExecutor) {
        info!("scheduler starting");
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "task run panicked or was cancelled");
                }
            }

            for (name, trigger) in self.take_due_at(Utc::now()).await {
                info!(name = %name, trigger = ?trigger, "starting task");
                let scheduler = self.clone();
                let executor = Arc::clone(&executor);
                in_flight.spawn(async move {
                    let outcome = executor(name.clone(), trigger).await;
                    if let Err(e) = scheduler.finish_at(&name, outcome, Utc::now()).await {
                        warn!(name = %name, error = %e, "failed to record task outcome");
                    }
                });
            }

            let sleep_duration = self.calculate_sleep_duration().await;

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(sleep_duration) => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "task run panicked or was cancelled");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight tasks");
        }
        while in_flight.join_next().await.is_some() {}

        info!("scheduler shut down gracefully");
    }
}
