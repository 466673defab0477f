//! Error types for queue and executor operations.

use thiserror::Error;

/// Errors produced when inserting into the delaying queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue has begun shutting down and accepts no new items.
    #[error("queue is shutting down")]
    ShuttingDown,
    /// Admitting the item would exceed the configured capacity.
    #[error("queue is at capacity")]
    Full,
}

/// Errors surfaced by the executor to producers and to its owner.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The action queue is full; the job was not accepted.
    #[error("action queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },
    /// The executor has been shut down.
    #[error("executor has been shut down")]
    ShutDown,
    /// Worker loops were already started.
    #[error("executor is already running")]
    AlreadyRunning,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal failure (worker thread could not be spawned, runtime build failed).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Application-facing result using anyhow for job logic and collaborators.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExecutorError::QueueFull { capacity: 3 };
        assert_eq!(err.to_string(), "action queue full (capacity 3)");

        let err = ExecutorError::InvalidConfig("worker_count must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: worker_count must be greater than 0"
        );

        assert_eq!(QueueError::ShuttingDown.to_string(), "queue is shutting down");
    }
}
