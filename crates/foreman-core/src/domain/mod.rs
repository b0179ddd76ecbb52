//! Domain model (IDs, records, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod log;
pub mod message;
pub mod stats;

pub use errors::{EngineError, WorkerError};
pub use events::{EngineEvent, RefreshNotification, StatusChangeEvent};
pub use ids::{JobId, MessageId, StepId};
pub use job::{JobRecord, JobStatus, MAX_CHILD_ERRORS};
pub use log::{LogEntry, LogLevel};
pub use message::{QueueMessage, WorkOrder};
pub use stats::JobTreeStats;
