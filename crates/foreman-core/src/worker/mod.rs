//! Worker contract, execution context, registry, and the polling pool.

mod pool;
mod registry;

pub use pool::WorkerPool;
pub(crate) use pool::PoolDeps;
pub use registry::WorkerRegistry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::aggregator::EventAggregator;
use crate::domain::{EngineError, JobId, JobRecord, LogLevel, WorkOrder, WorkerError};
use crate::jobs::JobStore;
use crate::logs::LogStore;
use crate::ports::IdGenerator;
use crate::queue::Queue;

/// A worker for one job kind.
///
/// `validate` fails fast on malformed input (immediate dead-letter, no
/// retry); `execute` classifies its failures through `WorkerError` and must
/// observe `ctx.is_cancelled` at safe checkpoints, never mid-side-effect.
#[async_trait]
pub trait JobWorker: Send + Sync {
    fn worker_type(&self) -> &str;

    fn validate(&self, job: &JobRecord) -> Result<(), WorkerError>;

    async fn execute(&self, ctx: &JobContext, job: &JobRecord) -> Result<(), WorkerError>;
}

/// Capabilities handed to an executing worker: child spawning, step
/// logging, and the cancellation checkpoint.
pub struct JobContext {
    jobs: Arc<JobStore>,
    queue: Arc<dyn Queue>,
    logs: Arc<LogStore>,
    aggregator: Arc<EventAggregator>,
    ids: Arc<dyn IdGenerator>,
    default_dlq_threshold: u32,
}

impl JobContext {
    pub(crate) fn new(
        jobs: Arc<JobStore>,
        queue: Arc<dyn Queue>,
        logs: Arc<LogStore>,
        aggregator: Arc<EventAggregator>,
        ids: Arc<dyn IdGenerator>,
        default_dlq_threshold: u32,
    ) -> Self {
        Self {
            jobs,
            queue,
            logs,
            aggregator,
            ids,
            default_dlq_threshold,
        }
    }

    /// Spawn a child job under `parent`: the child inherits the parent's
    /// step scope, gets its own id, and is enqueued immediately.
    pub async fn spawn_child(
        &self,
        parent: &JobRecord,
        kind: &str,
        name: &str,
        params: serde_json::Value,
    ) -> Result<JobId, EngineError> {
        let id = self.ids.job_id();
        let child = JobRecord::new_child(id, parent, kind, name, params, chrono::Utc::now());
        self.jobs.insert(child).await?;

        let order = WorkOrder::new(id, kind);
        self.queue
            .enqueue(order.to_payload()?, self.default_dlq_threshold)
            .await?;
        tracing::debug!(parent_id = %parent.id, child_id = %id, kind, "spawned child job");
        Ok(id)
    }

    /// Append one step log line. Best-effort: a sequencing or storage fault
    /// is logged and never fails the owning job.
    pub async fn log(&self, job: &JobRecord, level: LogLevel, message: impl Into<String>) {
        match self.logs.append(job.step_id, job.id, level, message).await {
            Ok(_) => self.aggregator.record_event(&job.step_id.to_string()),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "log append failed");
            }
        }
    }

    /// Cancellation checkpoint. Workers should abort (returning `Ok`) when
    /// this turns true; the pool records the `cancelled` transition.
    pub async fn is_cancelled(&self, job: &JobRecord) -> bool {
        self.jobs.is_cancel_requested(job.id).await
    }
}
