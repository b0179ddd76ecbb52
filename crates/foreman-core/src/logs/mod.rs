//! Step log sequencing and storage.

mod sequencer;
mod store;

pub use sequencer::{SequenceNumbers, StepSequencer};
pub use store::{LogStore, job_scope};
