//! Daemon command: scheduled refreshes plus the HTTP API.
//!
//! The daemon runs two long-lived parts that share one orchestrator:
//! - The scheduler loop, firing each refresh task on its main or retry cadence
//! - The axum server, serving cached projections and on-demand refreshes
//!
//! Both observe the same shutdown channel, flipped by Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::sync::watch;
use tracing::{error, info, warn};

use rozklad_scheduler::{Cadence, Scheduler, TaskSpec};
use rozklad_source::JetIqClient;
use rozklad_store::{MemoryCache, SqliteStore};
use rozklad_sync::{
    CacheInvalidator, Orchestrator, Projections, RefreshOp, RefreshOutcome, Reconciler,
    RefreshPipeline, StalePolicy, scheduled_executor,
};

use crate::api::{self, AppState};

/// Settings needed to build the refresh stack.
pub struct StackConfig {
    pub db_path: PathBuf,
    pub base_url: String,
    pub stale_policy: StalePolicy,
    /// Maximum concurrent lesson fetches.
    pub lesson_concurrency: usize,
    /// Upstream request timeout in seconds.
    pub fetch_timeout: u64,
}

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub stack: StackConfig,
    pub listen: String,
    pub faculties_cadence: Cadence,
    pub groups_cadence: Cadence,
    pub teachers_cadence: Cadence,
    pub lessons_cadence: Cadence,
    /// Retry cadence shared by every task.
    pub retry_cadence: Cadence,
    /// Refresh guard lifetime in seconds.
    pub guard_ttl: u64,
    /// Projection cache lifetime in seconds.
    pub cache_ttl: u64,
    pub refresh_on_start: bool,
}

impl DaemonConfig {
    fn task_specs(&self) -> Vec<TaskSpec> {
        [
            (RefreshOp::Faculties, self.faculties_cadence),
            (RefreshOp::Groups, self.groups_cadence),
            (RefreshOp::Teachers, self.teachers_cadence),
            (RefreshOp::Lessons, self.lessons_cadence),
        ]
        .into_iter()
        .filter_map(|(op, cadence)| {
            op.task_name()
                .map(|name| TaskSpec::new(name, cadence).with_retry(self.retry_cadence))
        })
        .collect()
    }
}

/// The wired-up refresh stack.
struct Stack {
    scheduler: Scheduler,
    orchestrator: Arc<Orchestrator>,
    invalidator: CacheInvalidator,
    store: Arc<SqliteStore>,
}

impl Stack {
    fn build(config: &StackConfig, guard_ttl: Duration) -> Result<Self> {
        let source = JetIqClient::with_timeout(
            config.base_url.clone(),
            Duration::from_secs(config.fetch_timeout),
        )
        .into_diagnostic()
        .wrap_err("failed to create upstream client")?;

        let store = Arc::new(
            SqliteStore::open(&config.db_path)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to open {}", config.db_path.display()))?,
        );
        let cache = Arc::new(MemoryCache::new());
        let scheduler = Scheduler::new();

        let invalidator = CacheInvalidator::new(cache, store.clone());
        let reconciler = Reconciler::new(store.clone(), config.stale_policy);
        let pipeline = RefreshPipeline::new(Arc::new(source), store.clone(), reconciler)
            .with_lesson_concurrency(config.lesson_concurrency);
        let orchestrator = Arc::new(
            Orchestrator::new(pipeline, invalidator.clone(), store.clone())
                .with_scheduler(scheduler.clone())
                .with_guard_ttl(guard_ttl),
        );

        info!(
            base_url = %config.base_url,
            stale_policy = %config.stale_policy,
            lesson_concurrency = config.lesson_concurrency,
            "refresh stack ready"
        );

        Ok(Self {
            scheduler,
            orchestrator,
            invalidator,
            store,
        })
    }
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let stack = Stack::build(&config.stack, Duration::from_secs(config.guard_ttl))?;

    for spec in config.task_specs() {
        stack
            .scheduler
            .register(spec)
            .await
            .into_diagnostic()
            .wrap_err("failed to register refresh task")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle Ctrl-C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    if config.refresh_on_start {
        let orchestrator = Arc::clone(&stack.orchestrator);
        tokio::spawn(async move {
            match orchestrator.refresh(RefreshOp::Everything).await {
                RefreshOutcome::Updated { rows_written } => {
                    info!(rows_written, "startup refresh completed");
                }
                other => warn!(outcome = ?other, "startup refresh did not complete"),
            }
        });
    }

    // Spawn scheduler task
    let scheduler_handle = {
        let scheduler = stack.scheduler.clone();
        let executor = scheduled_executor(Arc::clone(&stack.orchestrator));
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown_rx, executor).await;
        })
    };

    let projections = Projections::new(
        stack.store.clone(),
        stack.invalidator.clone(),
        Duration::from_secs(config.cache_ttl),
    );
    let router = api::create_router(Arc::new(AppState {
        orchestrator: Arc::clone(&stack.orchestrator),
        projections,
        scheduler: stack.scheduler.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind {}", config.listen))?;
    info!("HTTP API listening on http://{}", config.listen);

    let mut server_shutdown = shutdown_rx.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

    // The server may also stop on its own; make sure the scheduler follows
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task failed");
    }

    served.into_diagnostic().wrap_err("HTTP server failed")?;
    info!("daemon stopped");
    Ok(())
}

/// Run one operation against the configured upstream and print its summary.
pub async fn refresh_once(config: StackConfig, op: RefreshOp) -> Result<()> {
    let stack = Stack::build(&config, rozklad_sync::DEFAULT_GUARD_TTL)?;

    let summary = stack
        .orchestrator
        .execute(op)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("refresh of {} failed", op))?;

    println!(
        "{}: {} rows written, {} cache keys invalidated in {:.1}s",
        summary.op,
        summary.rows_written,
        summary.keys_invalidated,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
