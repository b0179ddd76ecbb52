//! Error taxonomy.
//!
//! Two layers:
//! - `WorkerError`: what a `JobWorker` reports about one unit of work. The
//!   pool converts these into ack/nack decisions and job status transitions;
//!   they never cross the pool boundary as process-level errors.
//! - `EngineError`: faults of the engine itself (routing, storage, leases).

use thiserror::Error;

use super::ids::{JobId, MessageId};

/// Outcome classification for one executed unit of work.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Malformed job/step config. Never retried: immediate dead-letter.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Retryable failure: the message is requeued, subject to the
    /// dead-letter threshold.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable domain failure: dead-lettered without requeue.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no manager registered for step kind `{0}`")]
    UnknownStepKind(String),

    #[error("duplicate manager for step kind `{0}`")]
    DuplicateManager(String),

    #[error("duplicate worker for kind `{0}`")]
    DuplicateWorker(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Ack/nack arrived after the lease expired and the message was handed
    /// to someone else (or dead-lettered).
    #[error("stale lease for message {0}")]
    StaleLease(MessageId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
