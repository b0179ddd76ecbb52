//! Engine: configuration, startup validation, and top-level wiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::aggregator::EventAggregator;
use crate::domain::{
    EngineError, EngineEvent, JobId, JobRecord, JobStatus, JobTreeStats, LogEntry, LogLevel,
    QueueMessage, StepId, WorkOrder,
};
use crate::impls::{BroadcastSink, MemoryStorage};
use crate::jobs::JobStore;
use crate::logs::{LogStore, job_scope};
use crate::orchestrator::{
    ManagerContext, MonitorDeps, MonitorRegistry, Router, StepConfig, StepManager,
};
use crate::ports::{EventSink, IdGenerator, Storage, SystemClock, UlidGenerator};
use crate::queue::{DurableQueue, Queue, QueueCounts};
use crate::worker::{JobContext, JobWorker, PoolDeps, WorkerPool, WorkerRegistry};

/// Engine configuration. Defaults suit a small single-process deployment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent execution slots.
    pub pool_size: usize,
    /// How long a leased message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// Idle poll backoff bounds.
    pub poll_backoff_min: Duration,
    pub poll_backoff_max: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub default_dlq_threshold: u32,
    /// Aggregation window length.
    pub flush_interval: Duration,
    /// Capacity of the outbound event broadcast.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            visibility_timeout: Duration::from_secs(30),
            poll_backoff_min: Duration::from_millis(100),
            poll_backoff_max: Duration::from_secs(5),
            default_dlq_threshold: 3,
            flush_interval: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

/// Startup validation failure.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing workers for kinds: {0:?} (expected but not registered)")]
    MissingWorkers(Vec<String>),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Builder for [`Engine`].
///
/// Registration is mutable here and immutable after `build`, so runtime
/// dispatch never synchronizes. `expect_kinds` opts into fail-fast startup
/// validation: build errors out unless every expected kind has a worker.
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn Storage>>,
    managers: HashMap<String, Arc<dyn StepManager>>,
    workers: WorkerRegistry,
    expected_kinds: Option<Vec<String>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            storage: None,
            managers: HashMap::new(),
            workers: WorkerRegistry::new(),
            expected_kinds: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage backend for queue, jobs, and logs. Defaults to in-memory.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Register the manager for one step kind. Exactly one per kind.
    pub fn register_manager(mut self, manager: Arc<dyn StepManager>) -> Result<Self, BuildError> {
        let kind = manager.kind().to_string();
        if self.managers.contains_key(&kind) {
            return Err(EngineError::DuplicateManager(kind).into());
        }
        self.managers.insert(kind, manager);
        Ok(self)
    }

    /// Register the worker for one job kind. Exactly one per kind.
    pub fn register_worker(mut self, worker: Arc<dyn JobWorker>) -> Result<Self, BuildError> {
        self.workers.register(worker)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|kind| kind.to_string()).collect());
        self
    }

    pub async fn build(self) -> Result<Engine, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let registered = self.workers.kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingWorkers(missing));
            }
        }

        let config = self.config;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let clock = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        let sink = Arc::new(BroadcastSink::new(config.event_capacity));

        let (queue, dlq_rx) =
            DurableQueue::open(Arc::clone(&storage), Arc::clone(&ids)).await?;
        let queue = Arc::new(queue);
        let jobs = Arc::new(JobStore::open(Arc::clone(&storage), clock.clone()).await?);
        let logs = Arc::new(LogStore::open(Arc::clone(&storage), clock).await?);
        let aggregator = Arc::new(EventAggregator::new(
            sink.clone() as Arc<dyn EventSink>,
            config.flush_interval,
        ));

        let ctx = Arc::new(JobContext::new(
            Arc::clone(&jobs),
            queue.clone() as Arc<dyn Queue>,
            Arc::clone(&logs),
            Arc::clone(&aggregator),
            Arc::clone(&ids),
            config.default_dlq_threshold,
        ));

        let monitors = Arc::new(MonitorRegistry::new(Arc::new(MonitorDeps {
            jobs: Arc::clone(&jobs),
            logs: Arc::clone(&logs),
            aggregator: Arc::clone(&aggregator),
            sink: sink.clone() as Arc<dyn EventSink>,
        })));

        let router = Router::new(
            self.managers,
            ManagerContext::new(
                Arc::clone(&jobs),
                queue.clone() as Arc<dyn Queue>,
                Arc::clone(&ids),
                config.default_dlq_threshold,
            ),
            Arc::clone(&monitors),
        );

        let pool = WorkerPool::spawn(
            config.pool_size,
            Arc::new(PoolDeps {
                queue: queue.clone() as Arc<dyn Queue>,
                jobs: Arc::clone(&jobs),
                registry: Arc::new(self.workers),
                ctx,
                visibility_timeout: config.visibility_timeout,
                backoff_min: config.poll_backoff_min,
                backoff_max: config.poll_backoff_max,
            }),
        );

        let dlq_task = tokio::spawn(consume_dead_letters(
            dlq_rx,
            Arc::clone(&jobs),
            Arc::clone(&logs),
        ));

        tracing::info!(
            pool_size = config.pool_size,
            dlq_threshold = config.default_dlq_threshold,
            "engine started"
        );

        Ok(Engine {
            queue,
            jobs,
            logs,
            router,
            monitors,
            sink,
            pool,
            dlq_task,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A message lands on the dead-letter channel once its retry budget is gone;
/// that is the terminal failure signal for the owning job.
async fn consume_dead_letters(
    mut dlq_rx: mpsc::UnboundedReceiver<QueueMessage>,
    jobs: Arc<JobStore>,
    logs: Arc<LogStore>,
) {
    while let Some(message) = dlq_rx.recv().await {
        let order = match WorkOrder::from_payload(&message.payload) {
            Ok(order) => order,
            Err(err) => {
                tracing::warn!(message_id = %message.id, error = %err, "unreadable dead letter");
                continue;
            }
        };
        tracing::warn!(
            message_id = %message.id,
            job_id = %order.job_id,
            attempts = message.attempt_count,
            "message dead-lettered"
        );
        // No-op if the pool already finalized the job.
        let reason = format!(
            "retry budget exhausted after {} delivery attempts",
            message.attempt_count
        );
        // The work order carries no step association, so the line lands in
        // the scope derived from the job id.
        if let Err(err) = logs
            .append(job_scope(order.job_id), order.job_id, LogLevel::Error, &reason)
            .await
        {
            tracing::warn!(job_id = %order.job_id, error = %err, "dead-letter log failed");
        }
        if let Err(err) = jobs
            .update_status(order.job_id, JobStatus::Failed, Some(reason))
            .await
        {
            tracing::warn!(job_id = %order.job_id, error = %err, "dead-letter transition failed");
        }
    }
}

/// The running engine. External callers interact only through this surface;
/// records are never mutated directly.
pub struct Engine {
    queue: Arc<DurableQueue>,
    jobs: Arc<JobStore>,
    logs: Arc<LogStore>,
    router: Router,
    monitors: Arc<MonitorRegistry>,
    sink: Arc<BroadcastSink>,
    pool: WorkerPool,
    dlq_task: JoinHandle<()>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Route one step: create its parent job and start monitoring the tree.
    pub async fn execute(&self, config: &StepConfig) -> Result<JobId, EngineError> {
        self.router.execute(config).await
    }

    /// Subscribe to refresh notifications and stats snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sink.subscribe()
    }

    pub async fn job(&self, id: JobId) -> Result<JobRecord, EngineError> {
        self.jobs.get(id).await
    }

    /// Point-in-time counts for a job tree. The pull endpoint behind stats
    /// snapshots.
    pub async fn job_stats(&self, id: JobId) -> Result<JobTreeStats, EngineError> {
        self.jobs.tree_stats(id).await
    }

    /// Bounded step log view. The pull endpoint behind refresh
    /// notifications: first `limit` lines on a start transition, last
    /// `limit` on a finished one.
    pub async fn logs(
        &self,
        step_id: StepId,
        limit: usize,
        from_end: bool,
    ) -> Result<Vec<LogEntry>, EngineError> {
        self.logs.logs(step_id, limit, from_end).await
    }

    /// Cross-step merged view, chronological by global sequence.
    pub async fn merged_logs(
        &self,
        step_ids: &[StepId],
        limit: usize,
    ) -> Result<Vec<LogEntry>, EngineError> {
        self.logs.merged_logs(step_ids, limit).await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, EngineError> {
        self.queue.counts().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<QueueMessage>, EngineError> {
        self.queue.dead_letters().await
    }

    /// Cancel a job tree: every non-terminal descendant gets the signal;
    /// running workers abort at their next checkpoint.
    pub async fn cancel(&self, id: JobId) -> Result<(), EngineError> {
        self.jobs.request_cancel(id).await
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Graceful shutdown: stop taking leases, wait for in-flight work, then
    /// stop monitors and the dead-letter consumer.
    pub async fn shutdown(self) {
        self.pool.shutdown_and_join().await;
        self.monitors.stop_all();
        self.dlq_task.abort();
        tracing::info!("engine stopped");
    }
}
