//! Step log sequencer.
//!
//! Two kinds of counter:
//! - one process-wide `global_sequence`, to interleave entries from
//!   different steps chronologically;
//! - one `step_line_number` counter per step, created lazily on first write
//!   and retired once the owning job tree is terminal.
//!
//! Both assignments are single atomic increments, so N concurrent writers
//! under one step obtain line numbers exactly `{1..N}` with no duplicates
//! and no gaps, regardless of interleaving. Counters are never reused.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::StepId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumbers {
    pub global_sequence: u64,
    pub step_line_number: u64,
}

#[derive(Default)]
pub struct StepSequencer {
    global: AtomicU64,
    steps: Mutex<HashMap<StepId, Arc<AtomicU64>>>,
}

impl StepSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn step_counter(&self, step_id: StepId) -> Arc<AtomicU64> {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(steps.entry(step_id).or_default())
    }

    /// Take the next `(global_sequence, step_line_number)` pair for `step_id`.
    pub fn assign(&self, step_id: StepId) -> SequenceNumbers {
        let counter = self.step_counter(step_id);
        SequenceNumbers {
            global_sequence: self.global.fetch_add(1, Ordering::Relaxed) + 1,
            step_line_number: counter.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Raise the step's counter to at least `last_line`. Used when reopening
    /// over persisted entries, so numbering resumes after the high-water
    /// mark instead of reusing lines.
    pub fn restore(&self, step_id: StepId, last_line: u64) {
        let counter = self.step_counter(step_id);
        counter.fetch_max(last_line, Ordering::Relaxed);
    }

    /// Raise the global counter to at least `last`.
    pub fn restore_global(&self, last: u64) {
        self.global.fetch_max(last, Ordering::Relaxed);
    }

    /// Drop the per-step counter. Call only once the step's owning job tree
    /// is terminal; a write after retirement would restart line numbering.
    pub fn retire(&self, step_id: &StepId) {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        steps.remove(step_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    #[test]
    fn per_step_numbers_are_independent() {
        let seq = StepSequencer::new();
        let a = StepId::from_ulid(Ulid::new());
        let b = StepId::from_ulid(Ulid::new());

        assert_eq!(seq.assign(a).step_line_number, 1);
        assert_eq!(seq.assign(a).step_line_number, 2);
        assert_eq!(seq.assign(b).step_line_number, 1);

        // Global sequence keeps counting across steps.
        assert_eq!(seq.assign(b).global_sequence, 4);
    }

    #[tokio::test]
    async fn concurrent_writers_get_gapless_line_numbers() {
        let seq = Arc::new(StepSequencer::new());
        let step = StepId::from_ulid(Ulid::new());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move { seq.assign(step) }));
        }

        let mut lines = BTreeSet::new();
        let mut globals = BTreeSet::new();
        for handle in handles {
            let numbers = handle.await.unwrap();
            lines.insert(numbers.step_line_number);
            globals.insert(numbers.global_sequence);
        }

        // Exactly {1..10}: no duplicates, no gaps.
        assert_eq!(lines, (1..=10).collect::<BTreeSet<u64>>());
        assert_eq!(globals.len(), 10);
    }

    #[test]
    fn restored_counters_resume_after_the_high_water_mark() {
        let seq = StepSequencer::new();
        let step = StepId::from_ulid(Ulid::new());

        seq.restore(step, 7);
        seq.restore_global(41);

        let numbers = seq.assign(step);
        assert_eq!(numbers.step_line_number, 8);
        assert_eq!(numbers.global_sequence, 42);

        // Restoring a lower mark never rolls a counter back.
        seq.restore(step, 3);
        assert_eq!(seq.assign(step).step_line_number, 9);
    }

    #[test]
    fn retire_drops_the_counter() {
        let seq = StepSequencer::new();
        let step = StepId::from_ulid(Ulid::new());

        seq.assign(step);
        seq.retire(&step);
        assert!(seq.steps.lock().unwrap().is_empty());
    }
}
