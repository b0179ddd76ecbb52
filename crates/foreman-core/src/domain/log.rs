//! Log entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One sequenced log line.
///
/// `step_line_number` is unique and gapless per step, regardless of which
/// job under that step produced the line. `global_sequence` is unique across
/// the whole process and orders entries from different steps chronologically.
/// Neither counter is ever reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step_id: StepId,
    pub job_id: JobId,
    pub global_sequence: u64,
    pub step_line_number: u64,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
