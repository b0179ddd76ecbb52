//! Ports: the seams between the engine and its collaborators.
//!
//! Everything durable goes through `Storage`; everything observable goes
//! through `EventSink`; time and id generation are injectable for tests.

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod storage;

pub use clock::{Clock, FixedClock, SystemClock};
pub use event_sink::EventSink;
pub use id_generator::{IdGenerator, UlidGenerator};
pub use storage::{Storage, prefix_range};
