//! Monitoring orchestrator: one long-lived task per root job, woken by
//! status-change broadcasts for its lineage.
//!
//! Design:
//! - One-way event propagation: the job store broadcasts transitions, the
//!   monitor filters by lineage and recomputes from the store. The monitor
//!   holds ids only, never references into the tree.
//! - Recomputation is serialized per root (it happens inline in the monitor
//!   task); different lineages recompute in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};

use crate::aggregator::EventAggregator;
use crate::domain::{EngineEvent, JobId, JobRecord, JobStatus, JobTreeStats, MAX_CHILD_ERRORS};
use crate::jobs::JobStore;
use crate::logs::LogStore;
use crate::ports::EventSink;

pub(crate) struct MonitorDeps {
    pub jobs: Arc<JobStore>,
    pub logs: Arc<LogStore>,
    pub aggregator: Arc<EventAggregator>,
    pub sink: Arc<dyn EventSink>,
}

/// Registry of active monitors, one per root job id. Starting a second
/// monitor for a root that already has one is a no-op.
pub struct MonitorRegistry {
    deps: Arc<MonitorDeps>,
    active: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl MonitorRegistry {
    pub(crate) fn new(deps: Arc<MonitorDeps>) -> Self {
        Self {
            deps,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begin monitoring `root`'s tree.
    pub fn start(self: &Arc<Self>, root: JobId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(&root) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        active.insert(root, stop_tx);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            run(Arc::clone(&registry.deps), root, stop_rx).await;
            registry.remove(root);
        });
    }

    pub fn is_active(&self, root: JobId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(&root)
    }

    /// Signal one monitor to stop, without waiting for it.
    pub fn stop(&self, root: JobId) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stop_tx) = active.get(&root) {
            let _ = stop_tx.send(true);
        }
    }

    pub fn stop_all(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for stop_tx in active.values() {
            let _ = stop_tx.send(true);
        }
    }

    fn remove(&self, root: JobId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&root);
    }
}

async fn run(deps: Arc<MonitorDeps>, root: JobId, mut stop_rx: watch::Receiver<bool>) {
    // Subscribe before the first evaluation so no transition slips between
    // the two.
    let mut status_rx = deps.jobs.subscribe();
    tracing::debug!(job_id = %root, "monitor started");

    if evaluate(&deps, root).await {
        tracing::debug!(job_id = %root, "monitor stopped");
        return;
    }

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            event = status_rx.recv() => match event {
                Ok(event) => {
                    if !deps.jobs.in_lineage(event.job_id, root).await {
                        continue;
                    }
                    if evaluate(&deps, root).await {
                        break;
                    }
                }
                // Dropped broadcasts cost us wakeups, not correctness: the
                // recomputation reads the authoritative store.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if evaluate(&deps, root).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(job_id = %root, "monitor stopped");
}

/// One recomputation for `root`: refresh aggregate counts, publish a stats
/// snapshot, and apply the tolerance / completion rules. Returns true when
/// the tree is finalized and monitoring should end.
async fn evaluate(deps: &MonitorDeps, root: JobId) -> bool {
    let root_job = match deps.jobs.get(root).await {
        Ok(job) => job,
        Err(err) => {
            tracing::warn!(job_id = %root, error = %err, "monitored job vanished");
            return true;
        }
    };
    let stats = match deps.jobs.tree_stats(root).await {
        Ok(stats) => stats,
        Err(_) => return true,
    };

    publish_counts(deps, root).await;

    if root_job.status.is_terminal() {
        // The root was finalized elsewhere (pool, external cancel, a prior
        // tolerance breach). Stay alive until the descendants drain, so
        // nothing is left running or pending under a dead root.
        if !settled(deps, root, &stats).await {
            if let Err(err) = deps.jobs.request_cancel(root).await {
                tracing::warn!(job_id = %root, error = %err, "subtree cancellation failed");
            }
            return false;
        }
        sweep_containers(deps, root, JobStatus::Cancelled).await;
        finish(deps, &root_job);
        return true;
    }

    let has_children = deps.jobs.has_children(root).await;

    if has_children && stats.failed > root_job.error_tolerance {
        let reason = format!(
            "{} child jobs failed, exceeding the tolerance of {}",
            stats.failed, root_job.error_tolerance
        );
        tracing::warn!(job_id = %root, "{reason}");
        if let Err(err) = deps
            .jobs
            .update_status(root, JobStatus::Failed, Some(reason))
            .await
        {
            tracing::warn!(job_id = %root, error = %err, "failed transition failed");
        }
        if let Err(err) = deps.jobs.request_cancel(root).await {
            tracing::warn!(job_id = %root, error = %err, "subtree cancellation failed");
        }

        // Pending leaves just flipped to cancelled; republish the counts.
        // The root's own failed transition re-wakes this monitor, and the
        // terminal branch above sees out any still-running leaves.
        publish_counts(deps, root).await;
        return false;
    }

    if !settled(deps, root, &stats).await {
        return false;
    }

    let status = if root_job.cancel_requested {
        JobStatus::Cancelled
    } else {
        JobStatus::Completed
    };
    // Finalize containers bottom-up, root last. The terminal guard leaves
    // already-failed or cancelled jobs untouched.
    sweep_containers(deps, root, status).await;
    if let Err(err) = deps.jobs.update_status(root, status, None).await {
        tracing::warn!(job_id = %root, error = %err, "root finalization failed");
    }
    tracing::info!(job_id = %root, ?status, "job tree finalized");
    finish(deps, &root_job);
    true
}

/// No further work can appear or finish in the tree. The leaf check on the
/// already-computed stats short-circuits the settled walk.
async fn settled(deps: &MonitorDeps, root: JobId, stats: &JobTreeStats) -> bool {
    stats.all_terminal() && deps.jobs.tree_settled(root).await.unwrap_or(true)
}

/// Containers are never executed to a terminal state; once the tree settles
/// the monitor closes them out.
async fn sweep_containers(deps: &MonitorDeps, root: JobId, status: JobStatus) {
    for id in deps.jobs.open_containers(root).await {
        if let Err(err) = deps.jobs.update_status(id, status, None).await {
            tracing::warn!(job_id = %id, error = %err, "container finalization failed");
        }
    }
}

/// Refresh the root's aggregate counters and publish a `{jobId, counts}`
/// snapshot. Best-effort: a fault here never affects execution.
async fn publish_counts(deps: &MonitorDeps, root: JobId) {
    let stats = match deps.jobs.tree_stats(root).await {
        Ok(stats) => stats,
        Err(_) => return,
    };
    let errors = deps.jobs.failed_child_errors(root, MAX_CHILD_ERRORS).await;
    if let Err(err) = deps
        .jobs
        .set_counts(root, stats.completed, stats.failed, errors)
        .await
    {
        tracing::warn!(job_id = %root, error = %err, "count update failed");
    }
    deps.sink.publish(EngineEvent::StatsSnapshot {
        job_id: root,
        counts: stats,
    });
}

/// End-of-tree cleanup: force the final refresh on the step channel and
/// retire its line counter. Called only once the tree has settled, so no
/// worker can still log under the step.
fn finish(deps: &MonitorDeps, root_job: &JobRecord) {
    deps.aggregator.finish(&root_job.step_id.to_string());
    deps.logs.retire_step(&root_job.step_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{BroadcastSink, MemoryStorage};
    use crate::ports::{Storage, SystemClock};
    use std::time::Duration;
    use ulid::Ulid;

    use crate::domain::StepId;
    use chrono::Utc;

    struct Fixture {
        jobs: Arc<JobStore>,
        registry: Arc<MonitorRegistry>,
        sink: Arc<BroadcastSink>,
    }

    async fn fixture() -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let clock = Arc::new(SystemClock);
        let jobs = Arc::new(
            JobStore::open(Arc::clone(&storage), clock.clone())
                .await
                .unwrap(),
        );
        let logs = Arc::new(LogStore::open(storage, clock).await.unwrap());
        let sink = Arc::new(BroadcastSink::new(64));
        let aggregator = Arc::new(EventAggregator::new(
            sink.clone() as Arc<dyn EventSink>,
            Duration::from_millis(20),
        ));
        let registry = Arc::new(MonitorRegistry::new(Arc::new(MonitorDeps {
            jobs: Arc::clone(&jobs),
            logs,
            aggregator,
            sink: sink.clone() as Arc<dyn EventSink>,
        })));
        Fixture {
            jobs,
            registry,
            sink,
        }
    }

    fn root_job(tolerance: u32) -> JobRecord {
        JobRecord::new_root(
            JobId::from_ulid(Ulid::new()),
            StepId::from_ulid(Ulid::new()),
            "crawl",
            "seed",
            tolerance,
            serde_json::json!({}),
            Utc::now(),
        )
    }

    fn child_of(parent: &JobRecord) -> JobRecord {
        JobRecord::new_child(
            JobId::from_ulid(Ulid::new()),
            parent,
            "crawl_unit",
            "page",
            serde_json::json!({}),
            Utc::now(),
        )
    }

    async fn wait_for_status(jobs: &JobStore, id: JobId, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if jobs.get(id).await.unwrap().status == status {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach expected status");
    }

    /// Five children, two fail, tolerance covers both: the parent completes.
    #[tokio::test]
    async fn failures_within_tolerance_complete_the_parent() {
        let fx = fixture().await;
        let root = root_job(2);
        let root_id = root.id;
        fx.jobs.insert(root.clone()).await.unwrap();
        fx.registry.start(root_id);

        let children: Vec<_> = (0..5).map(|_| child_of(&root)).collect();
        let ids: Vec<_> = children.iter().map(|c| c.id).collect();
        for child in children {
            fx.jobs.insert(child).await.unwrap();
        }
        fx.jobs.mark_unit_finished(root_id).await.unwrap();

        for id in &ids[..2] {
            fx.jobs
                .update_status(*id, JobStatus::Failed, Some("fetch failed".into()))
                .await
                .unwrap();
        }
        for id in &ids[2..] {
            fx.jobs
                .update_status(*id, JobStatus::Completed, None)
                .await
                .unwrap();
        }

        wait_for_status(&fx.jobs, root_id, JobStatus::Completed).await;
        let root = fx.jobs.get(root_id).await.unwrap();
        assert_eq!(root.result_count, 3);
        assert_eq!(root.failed_count, 2);
        assert_eq!(root.child_errors.len(), 2);
    }

    /// Zero tolerance: the first child failure fails the parent and cancels
    /// the still-pending siblings.
    #[tokio::test]
    async fn exceeded_tolerance_fails_the_parent_and_cancels_pending_children() {
        let fx = fixture().await;
        let root = root_job(0);
        let root_id = root.id;
        fx.jobs.insert(root.clone()).await.unwrap();
        fx.registry.start(root_id);

        let children: Vec<_> = (0..5).map(|_| child_of(&root)).collect();
        let ids: Vec<_> = children.iter().map(|c| c.id).collect();
        for child in children {
            fx.jobs.insert(child).await.unwrap();
        }
        fx.jobs.mark_unit_finished(root_id).await.unwrap();

        fx.jobs
            .update_status(ids[0], JobStatus::Failed, Some("fetch failed".into()))
            .await
            .unwrap();

        wait_for_status(&fx.jobs, root_id, JobStatus::Failed).await;
        for id in &ids[1..] {
            wait_for_status(&fx.jobs, *id, JobStatus::Cancelled).await;
        }
        let root = fx.jobs.get(root_id).await.unwrap();
        assert!(root.error.as_deref().unwrap().contains("exceeding the tolerance"));
    }

    /// The root's own unit fails fatally while children are still in
    /// flight: the monitor cancels the stragglers and only then exits.
    #[tokio::test]
    async fn failed_root_sweeps_in_flight_children() {
        let fx = fixture().await;
        let root = root_job(0);
        let root_id = root.id;
        fx.jobs.insert(root.clone()).await.unwrap();
        fx.registry.start(root_id);

        let child = child_of(&root);
        let child_id = child.id;
        fx.jobs.insert(child).await.unwrap();

        fx.jobs
            .update_status(root_id, JobStatus::Failed, Some("seed exploded".into()))
            .await
            .unwrap();

        wait_for_status(&fx.jobs, child_id, JobStatus::Cancelled).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.registry.is_active(root_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("monitor did not stop");
    }

    /// A childless root finalized by the pool: the monitor observes the
    /// terminal state, publishes final counts, and exits.
    #[tokio::test]
    async fn monitor_exits_once_a_leaf_root_is_terminal() {
        let fx = fixture().await;
        let mut rx = fx.sink.subscribe();
        let root = root_job(0);
        let root_id = root.id;
        fx.jobs.insert(root).await.unwrap();
        fx.registry.start(root_id);

        fx.jobs
            .update_status(root_id, JobStatus::Completed, None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let EngineEvent::StatsSnapshot { job_id, counts } = rx.recv().await.unwrap() {
                    if job_id == root_id && counts.completed == 1 {
                        break;
                    }
                }
            }
        })
        .await
        .expect("no final stats snapshot");

        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.registry.is_active(root_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("monitor did not stop");
    }

    /// Starting a second monitor for the same root is a no-op.
    #[tokio::test]
    async fn monitoring_is_a_singleton_per_root() {
        let fx = fixture().await;
        let root = root_job(0);
        let root_id = root.id;
        fx.jobs.insert(root).await.unwrap();

        fx.registry.start(root_id);
        fx.registry.start(root_id);
        assert!(fx.registry.is_active(root_id));

        fx.registry.stop(root_id);
        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.registry.is_active(root_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("monitor did not stop");
    }

    /// The tree may already be terminal when monitoring starts; the first
    /// evaluation must catch it without waiting for an event.
    #[tokio::test]
    async fn already_terminal_tree_is_finalized_immediately() {
        let fx = fixture().await;
        let root = root_job(0);
        let root_id = root.id;
        fx.jobs.insert(root.clone()).await.unwrap();
        let child = child_of(&root);
        let child_id = child.id;
        fx.jobs.insert(child).await.unwrap();
        fx.jobs.mark_unit_finished(root_id).await.unwrap();
        fx.jobs
            .update_status(child_id, JobStatus::Completed, None)
            .await
            .unwrap();

        fx.registry.start(root_id);
        wait_for_status(&fx.jobs, root_id, JobStatus::Completed).await;
    }
}
