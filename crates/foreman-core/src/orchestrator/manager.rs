//! Step managers: the kind-specific "create the parent job" half of routing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{EngineError, JobId, JobRecord, MessageId, WorkOrder};
use crate::jobs::JobStore;
use crate::ports::IdGenerator;
use crate::queue::Queue;

/// One step of a job definition, handed to the routing orchestrator when an
/// external scheduler decides it should fire.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub kind: String,
    pub name: String,
    /// Failed children accepted before the parent itself fails.
    pub error_tolerance: u32,
    pub params: serde_json::Value,
}

impl StepConfig {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            error_tolerance: 0,
            params: serde_json::Value::Null,
        }
    }

    pub fn error_tolerance(mut self, tolerance: u32) -> Self {
        self.error_tolerance = tolerance;
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Creates the parent job for one step kind and performs the kind-specific
/// initial enqueue.
#[async_trait]
pub trait StepManager: Send + Sync {
    fn kind(&self) -> &str;

    async fn create_parent_job(
        &self,
        ctx: &ManagerContext,
        config: &StepConfig,
    ) -> Result<JobId, EngineError>;
}

/// Capabilities handed to a manager: minting and persisting the root record,
/// and seeding the queue.
pub struct ManagerContext {
    jobs: Arc<JobStore>,
    queue: Arc<dyn Queue>,
    ids: Arc<dyn IdGenerator>,
    default_dlq_threshold: u32,
}

impl ManagerContext {
    pub(crate) fn new(
        jobs: Arc<JobStore>,
        queue: Arc<dyn Queue>,
        ids: Arc<dyn IdGenerator>,
        default_dlq_threshold: u32,
    ) -> Self {
        Self {
            jobs,
            queue,
            ids,
            default_dlq_threshold,
        }
    }

    /// Mint a root record for `config` with a fresh job id and step scope.
    pub fn new_root_record(&self, config: &StepConfig) -> JobRecord {
        JobRecord::new_root(
            self.ids.job_id(),
            self.ids.step_id(),
            &config.kind,
            &config.name,
            config.error_tolerance,
            config.params.clone(),
            chrono::Utc::now(),
        )
    }

    pub async fn insert(&self, job: JobRecord) -> Result<(), EngineError> {
        self.jobs.insert(job).await
    }

    /// Enqueue one unit of work for `job_id`.
    pub async fn enqueue(&self, job_id: JobId, kind: &str) -> Result<MessageId, EngineError> {
        let order = WorkOrder::new(job_id, kind);
        self.queue
            .enqueue(order.to_payload()?, self.default_dlq_threshold)
            .await
    }
}

/// Default manager: the parent job is itself the first unit of work, so
/// creation is "persist the record, enqueue one seed message of the same
/// kind". Workers that discover more work spawn children off that seed.
pub struct SeedJobManager {
    kind: String,
}

impl SeedJobManager {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

#[async_trait]
impl StepManager for SeedJobManager {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn create_parent_job(
        &self,
        ctx: &ManagerContext,
        config: &StepConfig,
    ) -> Result<JobId, EngineError> {
        let job = ctx.new_root_record(config);
        let id = job.id;
        ctx.insert(job).await?;
        ctx.enqueue(id, &self.kind).await?;
        tracing::info!(job_id = %id, kind = %self.kind, "created parent job");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStorage;
    use crate::ports::{Storage, SystemClock, UlidGenerator};
    use crate::queue::DurableQueue;

    async fn context() -> (ManagerContext, Arc<DurableQueue>, Arc<JobStore>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        let (queue, _dlq_rx) = DurableQueue::open(Arc::clone(&storage), Arc::clone(&ids))
            .await
            .unwrap();
        let queue = Arc::new(queue);
        let jobs = Arc::new(
            JobStore::open(storage, Arc::new(SystemClock))
                .await
                .unwrap(),
        );
        let ctx = ManagerContext::new(
            Arc::clone(&jobs),
            queue.clone() as Arc<dyn Queue>,
            ids,
            3,
        );
        (ctx, queue, jobs)
    }

    #[tokio::test]
    async fn seed_manager_persists_the_record_and_enqueues_one_message() {
        let (ctx, queue, jobs) = context().await;
        let manager = SeedJobManager::new("crawl");
        let config = StepConfig::new("crawl", "nightly crawl")
            .error_tolerance(2)
            .params(serde_json::json!({"start_url": "https://example.com"}));

        let id = manager.create_parent_job(&ctx, &config).await.unwrap();

        let job = jobs.get(id).await.unwrap();
        assert!(job.is_root());
        assert_eq!(job.error_tolerance, 2);
        assert_eq!(queue.counts().await.unwrap().ready, 1);
    }
}
