//! Job record: one node in a spawn tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, StepId};

/// Upper bound on child error summaries kept on a failed parent, so a
/// fan-out failure does not flood observers with every child's trace.
pub const MAX_CHILD_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are final: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Persisted job record.
///
/// Design:
/// - This is the single source of truth for job state; the lineage index in
///   the job store holds ids only.
/// - A record with `parent_id = None` is a root (parent) job; children form
///   a tree of unbounded depth under one root.
/// - Every job in a tree shares the root's `step_id`, so their log lines
///   share one numbering scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub parent_id: Option<JobId>,
    pub step_id: StepId,
    pub kind: String,
    pub name: String,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Maximum failed children a parent accepts before failing itself.
    pub error_tolerance: u32,

    /// Completed / failed descendant counts, maintained by the monitor.
    pub result_count: u32,
    pub failed_count: u32,

    /// The job's own error (validation/execution), if any.
    pub error: Option<String>,

    /// Bounded summaries of failed children (parents only).
    pub child_errors: Vec<String>,

    /// Cancellation was requested; workers abort at the next checkpoint.
    pub cancel_requested: bool,

    /// The job's own unit of work has finished executing. For parents this
    /// is distinct from `status`: a parent whose seed unit returned stays
    /// `running` until the monitor finalizes the tree.
    pub unit_finished: bool,

    /// Kind-specific parameters.
    pub params: serde_json::Value,
}

impl JobRecord {
    pub fn new_root(
        id: JobId,
        step_id: StepId,
        kind: impl Into<String>,
        name: impl Into<String>,
        error_tolerance: u32,
        params: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id: None,
            step_id,
            kind: kind.into(),
            name: name.into(),
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            error_tolerance,
            result_count: 0,
            failed_count: 0,
            error: None,
            child_errors: Vec::new(),
            cancel_requested: false,
            unit_finished: false,
            params,
        }
    }

    /// A child inherits the parent's step scope and points back at it.
    pub fn new_child(
        id: JobId,
        parent: &JobRecord,
        kind: impl Into<String>,
        name: impl Into<String>,
        params: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new_root(id, parent.step_id, kind, name, 0, params, created_at);
        record.parent_id = Some(parent.id);
        record
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case(JobStatus::Pending, false)]
    #[case(JobStatus::Running, false)]
    #[case(JobStatus::Completed, true)]
    #[case(JobStatus::Failed, true)]
    #[case(JobStatus::Cancelled, true)]
    fn terminal_states(#[case] status: JobStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn child_inherits_step_scope() {
        let step = StepId::from_ulid(Ulid::new());
        let root = JobRecord::new_root(
            JobId::from_ulid(Ulid::new()),
            step,
            "crawl",
            "seed",
            1,
            serde_json::json!({}),
            Utc::now(),
        );
        let child = JobRecord::new_child(
            JobId::from_ulid(Ulid::new()),
            &root,
            "crawl_unit",
            "page",
            serde_json::json!({"url": "x"}),
            Utc::now(),
        );

        assert_eq!(child.step_id, root.step_id);
        assert_eq!(child.parent_id, Some(root.id));
        assert!(root.is_root());
        assert!(!child.is_root());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
