use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, sleep};

use foreman_core::{
    Engine, EngineConfig, EngineEvent, JobContext, JobRecord, JobWorker, LogLevel, SeedJobManager,
    StepConfig, WorkerError,
};

#[derive(Debug, Deserialize)]
struct CrawlParams {
    start_url: String,
    page_count: usize,
}

/// Seed worker: pretends to fetch `start_url` and spawns one child per
/// discovered page.
struct CrawlWorker;

#[async_trait]
impl JobWorker for CrawlWorker {
    fn worker_type(&self) -> &str {
        "crawl"
    }

    fn validate(&self, job: &JobRecord) -> Result<(), WorkerError> {
        serde_json::from_value::<CrawlParams>(job.params.clone())
            .map(|_| ())
            .map_err(|e| WorkerError::Validation(format!("bad crawl params: {e}")))
    }

    async fn execute(&self, ctx: &JobContext, job: &JobRecord) -> Result<(), WorkerError> {
        let params: CrawlParams = serde_json::from_value(job.params.clone())
            .map_err(|e| WorkerError::Validation(format!("bad crawl params: {e}")))?;

        ctx.log(job, LogLevel::Info, format!("crawling {}", params.start_url))
            .await;
        for n in 0..params.page_count {
            if ctx.is_cancelled(job).await {
                return Ok(());
            }
            let url = format!("{}/page/{n}", params.start_url);
            ctx.spawn_child(job, "fetch_page", &url, serde_json::json!({ "url": url }))
                .await
                .map_err(|e| WorkerError::Transient(e.to_string()))?;
        }
        Ok(())
    }
}

/// Leaf worker: "fetches" one page; fails transiently the first few times to
/// show retries on the way to the final state.
struct FetchPageWorker {
    remaining_failures: AtomicU32,
}

impl FetchPageWorker {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl JobWorker for FetchPageWorker {
    fn worker_type(&self) -> &str {
        "fetch_page"
    }

    fn validate(&self, job: &JobRecord) -> Result<(), WorkerError> {
        if job.params.get("url").is_none() {
            return Err(WorkerError::Validation("missing `url`".into()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext, job: &JobRecord) -> Result<(), WorkerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(WorkerError::Transient(format!(
                "connection reset (left={left})"
            )));
        }
        ctx.log(job, LogLevel::Info, format!("fetched {}", job.name))
            .await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // (A) Build the engine: one manager and two workers, validated up front.
    let engine = Engine::builder()
        .config(EngineConfig {
            pool_size: 4,
            default_dlq_threshold: 3,
            flush_interval: Duration::from_millis(250),
            ..EngineConfig::default()
        })
        .register_manager(Arc::new(SeedJobManager::new("crawl")))?
        .register_worker(Arc::new(CrawlWorker))?
        .register_worker(Arc::new(FetchPageWorker::new(2)))?
        .expect_kinds(&["crawl", "fetch_page"])
        .build()
        .await?;

    // (B) Watch refresh notifications and stats snapshots in the background.
    let mut events = engine.subscribe();
    let observer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Refresh(n) => {
                    println!("refresh: channel={} finished={}", n.channel_key, n.finished);
                }
                EngineEvent::StatsSnapshot { job_id, counts } => {
                    println!(
                        "stats: job={job_id} pending={} running={} completed={} failed={}",
                        counts.pending, counts.running, counts.completed, counts.failed
                    );
                }
            }
        }
    });

    // (C) Fire one step, the way an external scheduler would.
    let config = StepConfig::new("crawl", "demo crawl").params(serde_json::json!({
        "start_url": "https://example.com",
        "page_count": 5,
    }));
    let root = engine.execute(&config).await?;
    println!("started job {root}");

    // (D) Poll until the tree reaches a terminal state.
    let job = loop {
        let job = engine.job(root).await?;
        if job.status.is_terminal() {
            break job;
        }
        sleep(Duration::from_millis(100)).await;
    };
    println!(
        "final status: {:?} (completed={}, failed={})",
        job.status, job.result_count, job.failed_count
    );

    // (E) Pull the last lines of the shared step log.
    for line in engine.logs(job.step_id, 10, true).await? {
        println!("  [{:>4}] {}", line.step_line_number, line.message);
    }

    engine.shutdown().await;
    observer.abort();
    Ok(())
}
