//! Storage-backed job store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};

use crate::domain::{
    EngineError, JobId, JobRecord, JobStatus, JobTreeStats, MAX_CHILD_ERRORS, StatusChangeEvent,
};
use crate::ports::{Clock, Storage, prefix_range};

fn job_key(id: JobId) -> String {
    format!("jobs/{id}")
}

/// In-memory index over the persisted job records.
struct JobIndex {
    /// Single source of truth for job state; everything else holds ids.
    jobs: HashMap<JobId, JobRecord>,
    children: HashMap<JobId, Vec<JobId>>,
}

impl JobIndex {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// Strict descendants of `root`, depth-first.
    fn descendants(&self, root: JobId) -> Vec<JobId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.children.get(&id) {
                for &child in children {
                    out.push(child);
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Leaf-job counts. Intermediate parents are containers; a root with no
    /// children counts itself.
    fn tree_stats(&self, root: JobId) -> JobTreeStats {
        let mut stats = JobTreeStats::default();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match self.children.get(&id) {
                Some(children) if !children.is_empty() => stack.extend(children.iter().copied()),
                _ => {
                    if let Some(job) = self.jobs.get(&id) {
                        stats.record(job.status);
                    }
                }
            }
        }
        stats
    }

    fn in_lineage(&self, id: JobId, root: JobId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == root {
                return true;
            }
            current = self.jobs.get(&id).and_then(|job| job.parent_id);
        }
        false
    }
}

fn event_for(job: &JobRecord) -> StatusChangeEvent {
    StatusChangeEvent {
        job_id: job.id,
        parent_id: job.parent_id,
        step_id: job.step_id,
        kind: job.kind.clone(),
        status: job.status,
    }
}

/// Job store.
///
/// Every status transition is persisted and then broadcast; the monitoring
/// orchestrator filters the broadcast by lineage. Transitions out of a
/// terminal state are silently ignored, which makes concurrent finalization
/// (pool, monitor, dead-letter consumer) idempotent.
pub struct JobStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    state: Mutex<JobIndex>,
    status_tx: broadcast::Sender<StatusChangeEvent>,
}

impl JobStore {
    /// Open over existing storage, rebuilding the in-memory index from the
    /// persisted records so recovered queue messages find their jobs again.
    pub async fn open(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let mut index = JobIndex::new();
        let (start, end) = prefix_range("jobs/");
        for (_, bytes) in storage.scan_range(&start, &end).await? {
            let job: JobRecord = serde_json::from_slice(&bytes)?;
            if let Some(parent) = job.parent_id {
                index.children.entry(parent).or_default().push(job.id);
            }
            index.jobs.insert(job.id, job);
        }
        let (status_tx, _) = broadcast::channel(1024);
        Ok(Self {
            storage,
            clock,
            state: Mutex::new(index),
            status_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangeEvent> {
        self.status_tx.subscribe()
    }

    fn emit(&self, event: StatusChangeEvent) {
        // No receivers is not a fault.
        let _ = self.status_tx.send(event);
    }

    async fn persist(&self, job: &JobRecord) -> Result<(), EngineError> {
        self.storage
            .put(&job_key(job.id), serde_json::to_vec(job)?)
            .await
    }

    pub async fn insert(&self, job: JobRecord) -> Result<(), EngineError> {
        let event = {
            let mut state = self.state.lock().await;
            self.persist(&job).await?;
            let event = event_for(&job);
            if let Some(parent) = job.parent_id {
                state.children.entry(parent).or_default().push(job.id);
            }
            state.jobs.insert(job.id, job);
            event
        };
        self.emit(event);
        Ok(())
    }

    pub async fn get(&self, id: JobId) -> Result<JobRecord, EngineError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or(EngineError::JobNotFound(id))
    }

    /// Transition `id` to `status`. A no-op when the job is already
    /// terminal: terminal states are final.
    pub async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let event = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let Some(job) = state.jobs.get_mut(&id) else {
                return Err(EngineError::JobNotFound(id));
            };
            if job.status.is_terminal() {
                return Ok(());
            }
            job.status = status;
            if status == JobStatus::Running && job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if status.is_terminal() {
                job.finished_at = Some(now);
            }
            if let Some(error) = error {
                job.error = Some(error);
            }
            let job = job.clone();
            self.persist(&job).await?;
            event_for(&job)
        };
        self.emit(event);
        Ok(())
    }

    /// Record that the job's own unit of work finished executing. Re-emits
    /// the current status so a monitor waiting on the tree re-evaluates.
    pub async fn mark_unit_finished(&self, id: JobId) -> Result<(), EngineError> {
        let event = {
            let mut state = self.state.lock().await;
            let Some(job) = state.jobs.get_mut(&id) else {
                return Err(EngineError::JobNotFound(id));
            };
            job.unit_finished = true;
            let job = job.clone();
            self.persist(&job).await?;
            event_for(&job)
        };
        self.emit(event);
        Ok(())
    }

    /// Maintain the parent's aggregate counters and (bounded) child error
    /// summaries.
    pub async fn set_counts(
        &self,
        id: JobId,
        result_count: u32,
        failed_count: u32,
        mut child_errors: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Err(EngineError::JobNotFound(id));
        };
        job.result_count = result_count;
        job.failed_count = failed_count;
        child_errors.truncate(MAX_CHILD_ERRORS);
        job.child_errors = child_errors;
        let job = job.clone();
        self.persist(&job).await
    }

    pub async fn has_children(&self, id: JobId) -> bool {
        let state = self.state.lock().await;
        state.children.get(&id).is_some_and(|c| !c.is_empty())
    }

    pub async fn in_lineage(&self, id: JobId, root: JobId) -> bool {
        let state = self.state.lock().await;
        state.in_lineage(id, root)
    }

    pub async fn tree_stats(&self, root: JobId) -> Result<JobTreeStats, EngineError> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&root) {
            return Err(EngineError::JobNotFound(root));
        }
        Ok(state.tree_stats(root))
    }

    /// True once no further work can appear in the tree: every leaf is
    /// terminal and every job that spawned children has finished executing
    /// its own unit (so it cannot spawn more).
    pub async fn tree_settled(&self, root: JobId) -> Result<bool, EngineError> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&root) {
            return Err(EngineError::JobNotFound(root));
        }
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(job) = state.jobs.get(&id) else {
                continue;
            };
            match state.children.get(&id) {
                Some(children) if !children.is_empty() => {
                    if !job.unit_finished && !job.status.is_terminal() {
                        return Ok(false);
                    }
                    stack.extend(children.iter().copied());
                }
                _ => {
                    if !job.status.is_terminal() {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Non-terminal descendants of `root` that have children of their own.
    /// These are containers nobody executes to a terminal state; the monitor
    /// finalizes them when the tree settles.
    pub async fn open_containers(&self, root: JobId) -> Vec<JobId> {
        let state = self.state.lock().await;
        state
            .descendants(root)
            .into_iter()
            .filter(|id| {
                state.children.get(id).is_some_and(|c| !c.is_empty())
                    && state.jobs.get(id).is_some_and(|j| !j.status.is_terminal())
            })
            .collect()
    }

    /// Error summaries of failed strict descendants, bounded by `limit`.
    pub async fn failed_child_errors(&self, root: JobId, limit: usize) -> Vec<String> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for id in state.descendants(root) {
            if out.len() >= limit {
                break;
            }
            let Some(job) = state.jobs.get(&id) else {
                continue;
            };
            if job.status == JobStatus::Failed {
                out.push(
                    job.error
                        .clone()
                        .unwrap_or_else(|| format!("{} failed", job.id)),
                );
            }
        }
        out
    }

    /// Request cancellation for the whole subtree: every non-terminal node
    /// (root included) gets the flag; pending leaves transition to
    /// `cancelled` immediately, running ones at the worker's next
    /// checkpoint.
    pub async fn request_cancel(&self, root: JobId) -> Result<(), EngineError> {
        let events = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = self.clock.now();
            let mut ids = state.descendants(root);
            ids.push(root);

            let mut events = Vec::new();
            let mut changed = Vec::new();
            for id in ids {
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                // Already-flagged jobs made their pending transition on the
                // pass that flagged them.
                if job.status.is_terminal() || job.cancel_requested {
                    continue;
                }
                job.cancel_requested = true;
                if job.status == JobStatus::Pending && id != root {
                    job.status = JobStatus::Cancelled;
                    job.finished_at = Some(now);
                    events.push(event_for(job));
                }
                changed.push(job.clone());
            }
            for job in &changed {
                self.persist(job).await?;
            }
            events
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    pub async fn is_cancel_requested(&self, id: JobId) -> bool {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .is_some_and(|job| job.cancel_requested)
    }
}
