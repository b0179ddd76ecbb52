//! Event sinks: broadcast fan-out and a null sink.

use tokio::sync::broadcast;

use crate::domain::EngineEvent;
use crate::ports::EventSink;

/// Fan-out sink over a tokio broadcast channel. Slow subscribers lag and
/// drop; the engine never blocks on them.
pub struct BroadcastSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: EngineEvent) {
        // No subscribers is not a fault.
        let _ = self.tx.send(event);
    }
}

/// Discards everything. The default sink when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: EngineEvent) {}
}
