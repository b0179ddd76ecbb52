//! Events: internal status-change fan-out and external notifications.

use serde::Serialize;

use super::ids::{JobId, StepId};
use super::job::JobStatus;
use super::stats::JobTreeStats;

/// Broadcast inside the engine whenever any job transitions status.
/// The monitoring orchestrator filters these by lineage.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChangeEvent {
    pub job_id: JobId,
    pub parent_id: Option<JobId>,
    pub step_id: StepId,
    pub kind: String,
    pub status: JobStatus,
}

/// Lightweight "something changed, pull a snapshot" signal published to
/// subscribers. Carries no payload data; consumers pull bounded views from
/// the stores instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshNotification {
    pub channel_key: String,
    pub finished: bool,
}

/// Everything the engine publishes through the `EventSink` port.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    Refresh(RefreshNotification),
    StatsSnapshot { job_id: JobId, counts: JobTreeStats },
}
