//! foreman-core
//!
//! Durable job-execution engine: a crash-safe queue with visibility-timeout
//! leases and dead-lettering, a bounded worker pool with backoff polling, a
//! routing/monitoring orchestration layer over hierarchical job trees, and an
//! event-aggregation layer that throttles high-frequency progress updates.
//!
//! Module map:
//! - **domain**: records and value types (ids, jobs, messages, logs, stats, events, errors)
//! - **ports**: abstraction seams (Storage, Clock, IdGenerator, EventSink)
//! - **impls**: in-process implementations of the ports
//! - **queue**: durable queue store (enqueue / lease / ack / nack / dead-letter)
//! - **logs**: step log sequencer and log store
//! - **jobs**: job store (lineage index, status transitions, tree stats, cancellation)
//! - **worker**: worker contract, registry, and the polling pool
//! - **orchestrator**: routing (step kind -> manager) and per-lineage monitoring
//! - **aggregator**: throttled refresh notifications per channel
//! - **engine**: builder and top-level wiring

pub mod aggregator;
pub mod domain;
pub mod engine;
pub mod impls;
pub mod jobs;
pub mod logs;
pub mod orchestrator;
pub mod ports;
pub mod queue;
pub mod worker;

pub use aggregator::EventAggregator;
pub use domain::{
    EngineError, EngineEvent, JobId, JobRecord, JobStatus, JobTreeStats, LogEntry, LogLevel,
    MessageId, QueueMessage, RefreshNotification, StatusChangeEvent, StepId, WorkOrder,
    WorkerError,
};
pub use engine::{BuildError, Engine, EngineBuilder, EngineConfig};
pub use jobs::JobStore;
pub use logs::LogStore;
pub use orchestrator::{ManagerContext, MonitorRegistry, Router, SeedJobManager, StepConfig, StepManager};
pub use ports::{Clock, EventSink, IdGenerator, Storage, SystemClock, UlidGenerator};
pub use queue::{DurableQueue, MessageLease, Queue, QueueCounts};
pub use worker::{JobContext, JobWorker, WorkerPool, WorkerRegistry};
