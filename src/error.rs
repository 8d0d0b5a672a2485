//! Error types shared across the queue, job, and worker APIs.
use thiserror::Error;

use crate::job::JobState;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned from user handlers to signal a failed attempt.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// The store could not be reached or rejected an operation. Inside
    /// worker and promoter loops this is also fanned out on the queue's
    /// activity feed, since there is no direct caller to return it to.
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    /// The job no longer exists: it was removed, or another process won
    /// the claim/promotion race for it.
    #[error("job {0} not found")]
    NotFound(u64),
    /// The operation needs an id, which is only assigned by `save`.
    #[error("job has not been saved")]
    Unsaved,
    /// Complete and failed jobs never transition again except by removal.
    #[error("job {id} is {state} and cannot transition")]
    TerminalState { id: u64, state: JobState },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    /// A record or envelope that cannot be (de)coded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
