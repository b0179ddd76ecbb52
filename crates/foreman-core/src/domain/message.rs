//! Queue message and the work-order payload it carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, MessageId};

/// One durable queue message.
///
/// Owned by the queue store until leased; the leasing worker owns it until
/// ack/nack; ownership reverts on nack or lease expiry. `attempt_count`
/// counts failed deliveries (nack-with-requeue or lease expiry); once it
/// exceeds `dlq_threshold` the message moves to the dead-letter channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub dlq_threshold: u32,
    /// Set while a live lease exists; informational for the leaseholder.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// The payload the engine itself enqueues: a pointer to the job to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub job_id: JobId,
    pub kind: String,
}

impl WorkOrder {
    pub fn new(job_id: JobId, kind: impl Into<String>) -> Self {
        Self {
            job_id,
            kind: kind.into(),
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}
