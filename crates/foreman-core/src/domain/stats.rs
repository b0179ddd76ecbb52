//! Point-in-time counts over one job tree.

use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// Leaf-job counts for a tree. Intermediate parents are organizational
/// containers and are not counted; a root with no children counts itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTreeStats {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl JobTreeStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    /// True once no leaf can still make progress.
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}
