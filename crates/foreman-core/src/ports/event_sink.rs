//! EventSink port: "broadcast to subscribers", wire framing external.
//!
//! Publishing is infallible from the caller's point of view: a notification
//! fault must never fail the owning job, so implementations log and drop.

use crate::domain::EngineEvent;

pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}
