//! In-process implementations of the ports.

pub mod broadcast_sink;
pub mod memory_storage;

pub use broadcast_sink::{BroadcastSink, NullSink};
pub use memory_storage::MemoryStorage;
