//! Error Types
//!
//! Synchronous errors surfaced to the calling thread. Failures inside
//! background callbacks are never raised here; they are logged and
//! handled per component (see `LoopStep::Failed` and `JobOutcome::Failed`).

use std::time::Duration;

/// Errors returned by the toolkit's synchronous operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Worker pool configured with zero workers.
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,

    /// `put` could not enqueue within its timeout; the item was dropped.
    #[error("queue still full after {timeout:?}")]
    QueueFull { timeout: Option<Duration> },

    /// `add_job` called with a key that is already scheduled.
    #[error("job with key {key} already exists")]
    KeyExists { key: String },

    /// `remove_job` called with a key that is not scheduled.
    #[error("no job with key {key}")]
    UnknownJob { key: String },

    /// `run` called while the loop is already active on another thread.
    #[error("thread loop already active")]
    LoopActive,
}
