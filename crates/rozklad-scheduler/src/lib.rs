//! Refresh task scheduler for rozklad.
//!
//! This crate provides a process-wide table of named tasks where each task:
//! - Fires on a main cadence (interval, daily or weekly)
//! - Has a linked fast retry cadence that is armed by a failure
//! - Pauses that retry cadence again on the next success

mod error;
mod scheduler;
mod types;

pub use error::SchedulerError;
pub use scheduler::{Scheduler, TaskExecutor};
pub use types::{Cadence, EscalationState, Task, TaskOutcome, TaskSpec, TimerEntry, Trigger};
