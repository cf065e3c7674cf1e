//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task already registered.
    #[error("task already registered: {0}")]
    TaskExists(String),

    /// Task not registered.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Invalid cadence specification.
    #[error("invalid cadence: {0}")]
    InvalidCadence(String),
}
