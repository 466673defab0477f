//! Core job model, error taxonomy and the executor.

pub mod error;
pub mod executor;
pub mod job;

pub use error::{AppResult, ExecutorError, QueueError};
pub use executor::{Executor, ExecutorStats, CONFLICT_REQUEUE_DELAY};
pub use job::{Job, JobContext, JobKey, JobOutcome, SharedJob};
