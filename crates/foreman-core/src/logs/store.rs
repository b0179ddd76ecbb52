//! Log store: sequenced append plus the bounded pull endpoints.

use std::sync::Arc;

use crate::domain::{EngineError, JobId, LogEntry, LogLevel, StepId};
use crate::logs::StepSequencer;
use crate::ports::{Clock, Storage, prefix_range};

/// Scope for log lines with no step association: derived from the job id,
/// so step-less lines still get a gapless per-scope number.
pub fn job_scope(job_id: JobId) -> StepId {
    StepId::from_ulid(job_id.as_ulid())
}

fn log_key(step_id: StepId, line: u64) -> String {
    // Zero-padded line number keeps storage order == line order.
    format!("logs/{step_id}/{line:010}")
}

pub struct LogStore {
    storage: Arc<dyn Storage>,
    sequencer: StepSequencer,
    clock: Arc<dyn Clock>,
}

impl LogStore {
    /// Open over existing storage. Counters resume after the highest
    /// persisted line and global sequence per step, so numbers are never
    /// reused across restarts.
    pub async fn open(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let sequencer = StepSequencer::new();
        let (start, end) = prefix_range("logs/");
        for (_, bytes) in storage.scan_range(&start, &end).await? {
            let entry: LogEntry = serde_json::from_slice(&bytes)?;
            sequencer.restore(entry.step_id, entry.step_line_number);
            sequencer.restore_global(entry.global_sequence);
        }
        Ok(Self {
            storage,
            sequencer,
            clock,
        })
    }

    /// Assign sequence numbers and persist one entry.
    pub async fn append(
        &self,
        step_id: StepId,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<LogEntry, EngineError> {
        let numbers = self.sequencer.assign(step_id);
        let entry = LogEntry {
            step_id,
            job_id,
            global_sequence: numbers.global_sequence,
            step_line_number: numbers.step_line_number,
            level,
            message: message.into(),
            timestamp: self.clock.now(),
        };
        self.storage
            .put(
                &log_key(step_id, entry.step_line_number),
                serde_json::to_vec(&entry)?,
            )
            .await?;
        Ok(entry)
    }

    /// Bounded single-step view, ascending by line number. `from_end` selects
    /// the last `limit` lines (the pull made on a `finished` refresh);
    /// otherwise the first `limit` (the pull made on a `start` refresh).
    pub async fn logs(
        &self,
        step_id: StepId,
        limit: usize,
        from_end: bool,
    ) -> Result<Vec<LogEntry>, EngineError> {
        let (start, end) = prefix_range(&format!("logs/{step_id}/"));
        let rows = self.storage.scan_range(&start, &end).await?;

        let mut entries = Vec::with_capacity(rows.len().min(limit));
        let skip = if from_end {
            rows.len().saturating_sub(limit)
        } else {
            0
        };
        for (_, bytes) in rows.into_iter().skip(skip).take(limit) {
            entries.push(serde_json::from_slice(&bytes)?);
        }
        Ok(entries)
    }

    /// Cross-step merged view, ascending by global sequence.
    pub async fn merged_logs(
        &self,
        step_ids: &[StepId],
        limit: usize,
    ) -> Result<Vec<LogEntry>, EngineError> {
        let mut entries: Vec<LogEntry> = Vec::new();
        for step_id in step_ids {
            let (start, end) = prefix_range(&format!("logs/{step_id}/"));
            for (_, bytes) in self.storage.scan_range(&start, &end).await? {
                entries.push(serde_json::from_slice(&bytes)?);
            }
        }
        entries.sort_by_key(|entry| entry.global_sequence);
        entries.truncate(limit);
        Ok(entries)
    }

    /// Retire the step's line counter. Safe only once the owning job tree is
    /// terminal.
    pub fn retire_step(&self, step_id: &StepId) {
        self.sequencer.retire(step_id);
    }
}
