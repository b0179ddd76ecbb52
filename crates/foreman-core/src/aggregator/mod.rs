//! Event aggregator: collapses bursts of fine-grained events into throttled
//! refresh notifications.
//!
//! `record_event(channel_key)` only bumps a pending counter; the first event
//! after a flush creates the channel's window and arms a one-shot flush
//! timer. Flushing publishes a single `{channel_key, finished}` refresh and
//! destroys the window, so consumers pull a bounded snapshot instead of
//! receiving every event. A `finished` signal flushes immediately, taking
//! priority over the timer; the orphaned timer tick later finds no window
//! and is suppressed, as is any tick for a window with zero pending events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{EngineEvent, RefreshNotification};
use crate::ports::EventSink;

struct Window {
    pending: u64,
}

pub struct EventAggregator {
    windows: Mutex<HashMap<String, Window>>,
    sink: Arc<dyn EventSink>,
    flush_interval: Duration,
}

impl EventAggregator {
    pub fn new(sink: Arc<dyn EventSink>, flush_interval: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            sink,
            flush_interval,
        }
    }

    /// Count one event for `channel_key` without transmitting anything.
    /// Arms the channel's flush timer if no window exists yet.
    pub fn record_event(self: &Arc<Self>, channel_key: &str) {
        let armed = {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            match windows.get_mut(channel_key) {
                Some(window) => {
                    window.pending += 1;
                    false
                }
                None => {
                    windows.insert(channel_key.to_string(), Window { pending: 1 });
                    true
                }
            }
        };

        if armed {
            let aggregator = Arc::clone(self);
            let key = channel_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(aggregator.flush_interval).await;
                aggregator.flush(&key, false);
            });
        }
    }

    /// Terminal signal: flush immediately regardless of timer state. Always
    /// publishes, even with zero pending events, because observers need the
    /// `finished` transition.
    pub fn finish(&self, channel_key: &str) {
        self.flush(channel_key, true);
    }

    fn flush(&self, channel_key: &str, finished: bool) {
        let pending = {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            windows
                .remove(channel_key)
                .map(|window| window.pending)
                .unwrap_or(0)
        };

        // No-op ticks are suppressed.
        if pending == 0 && !finished {
            return;
        }

        tracing::debug!(channel = channel_key, pending, finished, "flushing channel");
        self.sink.publish(EngineEvent::Refresh(RefreshNotification {
            channel_key: channel_key.to_string(),
            finished,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::BroadcastSink;
    use tokio::sync::broadcast::error::TryRecvError;

    fn refresh(event: EngineEvent) -> RefreshNotification {
        match event {
            EngineEvent::Refresh(n) => n,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn burst_collapses_into_one_refresh() {
        let sink = Arc::new(BroadcastSink::new(16));
        let mut rx = sink.subscribe();
        let aggregator = Arc::new(EventAggregator::new(
            sink.clone(),
            Duration::from_millis(20),
        ));

        for _ in 0..50 {
            aggregator.record_event("step-a");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let notification = refresh(rx.recv().await.unwrap());
        assert_eq!(notification.channel_key, "step-a");
        assert!(!notification.finished);

        // One refresh for the whole burst, nothing queued behind it.
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn zero_pending_tick_is_suppressed() {
        let sink = Arc::new(BroadcastSink::new(16));
        let mut rx = sink.subscribe();
        let aggregator = Arc::new(EventAggregator::new(
            sink.clone(),
            Duration::from_millis(20),
        ));

        aggregator.record_event("step-a");
        tokio::time::sleep(Duration::from_millis(60)).await;
        rx.recv().await.unwrap(); // the one real flush

        // No further events recorded: quiet channels are not re-flushed.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn finished_flushes_immediately_and_wins_over_the_timer() {
        let sink = Arc::new(BroadcastSink::new(16));
        let mut rx = sink.subscribe();
        let aggregator = Arc::new(EventAggregator::new(sink.clone(), Duration::from_secs(60)));

        aggregator.record_event("step-a");
        aggregator.finish("step-a");

        // Published without waiting for the (60s) timer.
        let notification = refresh(rx.try_recv().unwrap());
        assert!(notification.finished);

        // The orphaned timer tick finds no window and publishes nothing;
        // we can't wait 60s here, but a fresh zero-pending flush shows the
        // suppression path directly.
        aggregator.flush("step-a", false);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn channels_flush_independently() {
        let sink = Arc::new(BroadcastSink::new(16));
        let mut rx = sink.subscribe();
        let aggregator = Arc::new(EventAggregator::new(
            sink.clone(),
            Duration::from_millis(20),
        ));

        aggregator.record_event("step-a");
        aggregator.record_event("step-b");
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut keys = vec![
            refresh(rx.recv().await.unwrap()).channel_key,
            refresh(rx.recv().await.unwrap()).channel_key,
        ];
        keys.sort();
        assert_eq!(keys, vec!["step-a", "step-b"]);
    }
}
