//! Durable queue: traits, poll backoff, and the storage-backed store.

mod backoff;
mod store;

pub use backoff::PollBackoff;
pub use store::DurableQueue;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EngineError, MessageId, QueueMessage};

/// Counts by message state, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub ready: usize,
    pub leased: usize,
    pub dead_lettered: usize,
}

/// A leased message. The holder owns it until `ack` or `nack`.
///
/// Design intent:
/// - The queue manages visibility and retry/dead-letter policy.
/// - The worker executes side effects and reports the outcome.
/// - `ack`/`nack` consume the lease; a lease can be resolved exactly once.
#[async_trait]
pub trait MessageLease: Send {
    fn message(&self) -> &QueueMessage;

    /// Mark success: the message is removed for good.
    async fn ack(self: Box<Self>) -> Result<(), EngineError>;

    /// Mark failure. `requeue = true` puts the message back (front of the
    /// visible set) subject to the dead-letter threshold; `requeue = false`
    /// dead-letters it immediately.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), EngineError>;
}

/// Queue port. The durable store is the only implementation shipped, but
/// this trait is the seam for swapping backends.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(
        &self,
        payload: serde_json::Value,
        dlq_threshold: u32,
    ) -> Result<MessageId, EngineError>;

    /// Lease one visible message for `visibility`, or `None` when nothing is
    /// ready. Non-blocking: the worker pool supplies the idle backoff.
    async fn lease(&self, visibility: Duration)
    -> Result<Option<Box<dyn MessageLease>>, EngineError>;

    async fn counts(&self) -> Result<QueueCounts, EngineError>;

    /// Snapshot of the dead-letter channel.
    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, EngineError>;
}
