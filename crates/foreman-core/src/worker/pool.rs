//! Worker pool: a fixed set of slots polling the queue with idle backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{JobStatus, WorkOrder, WorkerError};
use crate::jobs::JobStore;
use crate::queue::{MessageLease, PollBackoff, Queue};
use crate::worker::{JobContext, WorkerRegistry};

/// Everything one slot needs.
pub(crate) struct PoolDeps {
    pub queue: Arc<dyn Queue>,
    pub jobs: Arc<JobStore>,
    pub registry: Arc<WorkerRegistry>,
    pub ctx: Arc<JobContext>,
    pub visibility_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

/// Worker pool handle.
/// - `request_shutdown` stops slots from taking new leases.
/// - `shutdown_and_join` additionally waits for in-flight executions.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(n: usize, deps: Arc<PoolDeps>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for slot in 0..n {
            let deps = Arc::clone(&deps);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                slot_loop(slot, deps, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    /// Request shutdown for all slots. In-flight handler execution is not
    /// cancelled; slots just stop taking new leases.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn slot_loop(slot: usize, deps: Arc<PoolDeps>, shutdown_rx: &mut watch::Receiver<bool>) {
    let mut backoff = PollBackoff::new(deps.backoff_min, deps.backoff_max);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let lease = match deps.queue.lease(deps.visibility_timeout).await {
            Ok(Some(lease)) => {
                backoff.reset();
                lease
            }
            Ok(None) => {
                idle_wait(&mut backoff, shutdown_rx).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(slot, error = %err, "lease failed");
                idle_wait(&mut backoff, shutdown_rx).await;
                continue;
            }
        };

        process(slot, &deps, lease).await;
    }
}

/// Sleep the current backoff delay, or wake early on shutdown.
async fn idle_wait(backoff: &mut PollBackoff, shutdown_rx: &mut watch::Receiver<bool>) {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = shutdown_rx.changed() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

/// Execute one leased message. Worker errors are contained here: they become
/// job status transitions and ack/nack decisions, never process errors.
async fn process(slot: usize, deps: &PoolDeps, lease: Box<dyn MessageLease>) {
    let message_id = lease.message().id;

    let order = match WorkOrder::from_payload(&lease.message().payload) {
        Ok(order) => order,
        Err(err) => {
            tracing::warn!(slot, message_id = %message_id, error = %err, "malformed payload, dead-lettering");
            if let Err(err) = lease.nack(false).await {
                tracing::warn!(slot, error = %err, "nack failed");
            }
            return;
        }
    };

    let job = match deps.jobs.get(order.job_id).await {
        Ok(job) => job,
        Err(err) => {
            // Record gone; the message points at nothing.
            tracing::warn!(slot, job_id = %order.job_id, error = %err, "job record missing, dropping message");
            if let Err(err) = lease.ack().await {
                tracing::warn!(slot, error = %err, "ack failed");
            }
            return;
        }
    };

    // Checkpoint before any side effect.
    if job.status.is_terminal() {
        if let Err(err) = lease.ack().await {
            tracing::warn!(slot, error = %err, "ack failed");
        }
        return;
    }
    if deps.jobs.is_cancel_requested(job.id).await {
        if let Err(err) = deps
            .jobs
            .update_status(job.id, JobStatus::Cancelled, None)
            .await
        {
            tracing::warn!(slot, job_id = %job.id, error = %err, "cancel transition failed");
        }
        if let Err(err) = lease.ack().await {
            tracing::warn!(slot, error = %err, "ack failed");
        }
        return;
    }

    let Some(worker) = deps.registry.get(&job.kind) else {
        let reason = format!("no worker registered for kind `{}`", job.kind);
        tracing::warn!(slot, job_id = %job.id, "{reason}");
        finalize_failed(deps, &job, reason).await;
        if let Err(err) = lease.nack(false).await {
            tracing::warn!(slot, error = %err, "nack failed");
        }
        return;
    };

    // Fail fast on malformed input: straight to the dead-letter channel.
    if let Err(err) = worker.validate(&job) {
        tracing::warn!(slot, job_id = %job.id, error = %err, "validation failed");
        finalize_failed(deps, &job, err.to_string()).await;
        if let Err(err) = lease.nack(false).await {
            tracing::warn!(slot, error = %err, "nack failed");
        }
        return;
    }

    if let Err(err) = deps
        .jobs
        .update_status(job.id, JobStatus::Running, None)
        .await
    {
        tracing::warn!(slot, job_id = %job.id, error = %err, "running transition failed");
    }

    let result = worker.execute(&deps.ctx, &job).await;

    match result {
        Ok(()) => {
            if let Err(err) = deps.jobs.mark_unit_finished(job.id).await {
                tracing::warn!(slot, job_id = %job.id, error = %err, "unit-finished mark failed");
            }
            if deps.jobs.is_cancel_requested(job.id).await {
                // Worker aborted at a checkpoint.
                if let Err(err) = deps
                    .jobs
                    .update_status(job.id, JobStatus::Cancelled, None)
                    .await
                {
                    tracing::warn!(slot, job_id = %job.id, error = %err, "cancel transition failed");
                }
            } else if deps.jobs.has_children(job.id).await {
                // A parent whose unit spawned children stays running; the
                // monitor finalizes the tree.
            } else if let Err(err) = deps
                .jobs
                .update_status(job.id, JobStatus::Completed, None)
                .await
            {
                tracing::warn!(slot, job_id = %job.id, error = %err, "completed transition failed");
            }
            if let Err(err) = lease.ack().await {
                tracing::warn!(slot, error = %err, "ack failed");
            }
        }
        Err(WorkerError::Transient(reason)) => {
            tracing::warn!(slot, job_id = %job.id, error = %reason, "transient failure, requeueing");
            // Back to pending; the dead-letter consumer marks the job
            // failed if the retry budget runs out.
            if let Err(err) = deps
                .jobs
                .update_status(job.id, JobStatus::Pending, Some(reason))
                .await
            {
                tracing::warn!(slot, job_id = %job.id, error = %err, "pending transition failed");
            }
            if let Err(err) = lease.nack(true).await {
                tracing::warn!(slot, error = %err, "nack failed");
            }
        }
        Err(err) => {
            // Validation or Fatal from execute: non-retryable.
            tracing::warn!(slot, job_id = %job.id, error = %err, "fatal failure, dead-lettering");
            if let Err(err) = deps.jobs.mark_unit_finished(job.id).await {
                tracing::warn!(slot, job_id = %job.id, error = %err, "unit-finished mark failed");
            }
            finalize_failed(deps, &job, err.to_string()).await;
            if let Err(err) = lease.nack(false).await {
                tracing::warn!(slot, error = %err, "nack failed");
            }
        }
    }
}

async fn finalize_failed(deps: &PoolDeps, job: &crate::domain::JobRecord, reason: String) {
    if let Err(err) = deps
        .jobs
        .update_status(job.id, JobStatus::Failed, Some(reason))
        .await
    {
        tracing::warn!(job_id = %job.id, error = %err, "failed transition failed");
    }
}
