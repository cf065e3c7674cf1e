//! Synchronization of the local schedule mirror.
//!
//! This crate ties the upstream source, storage, cache and scheduler together:
//! - [`Reconciler`] merges fetched snapshots into storage
//! - [`RefreshPipeline`] orders refreshes and repairs missing teachers once
//! - [`CacheInvalidator`] evicts exactly the projections a change affects
//! - [`Orchestrator`] runs operations for the scheduler and on demand

mod error;
pub mod invalidate;
mod orchestrator;
mod pipeline;
pub mod projection;
mod reconcile;

pub use error::SyncError;
pub use invalidate::{CacheInvalidator, GuardSet, RefreshGuard};
pub use orchestrator::{
    DEFAULT_GUARD_TTL, Orchestrator, RefreshOp, RefreshOutcome, RunSummary, scheduled_executor,
};
pub use pipeline::{ChangeLog, DEFAULT_LESSON_CONCURRENCY, RefreshPipeline};
pub use projection::Projections;
pub use reconcile::{Batch, ChangeSet, Reconciler, StalePolicy};
