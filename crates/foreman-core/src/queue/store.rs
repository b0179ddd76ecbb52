//! Storage-backed durable queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};

use crate::domain::{EngineError, MessageId, QueueMessage};
use crate::ports::{IdGenerator, Storage, prefix_range};
use crate::queue::{MessageLease, Queue, QueueCounts};

const MSG_PREFIX: &str = "queue/msg/";
const DLQ_PREFIX: &str = "queue/dlq/";

fn msg_key(id: MessageId) -> String {
    format!("{MSG_PREFIX}{id}")
}

fn dlq_key(id: MessageId) -> String {
    format!("{DLQ_PREFIX}{id}")
}

/// A live lease held by one worker.
struct LiveLease {
    token: u64,
    expires_at: Instant,
}

/// In-memory index over the persisted messages.
///
/// Design:
/// - `messages` is the single source of truth in memory; `ready`/`leased`/
///   `dead` hold ids only.
/// - Storage always holds the authoritative copy: the index is rebuilt from
///   a scan on `open`, and a crash simply drops live leases (the messages
///   come back as ready).
struct QueueState {
    messages: HashMap<MessageId, QueueMessage>,
    ready: VecDeque<MessageId>,
    leased: HashMap<MessageId, LiveLease>,
    dead: Vec<MessageId>,
    next_token: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            messages: HashMap::new(),
            ready: VecDeque::new(),
            leased: HashMap::new(),
            dead: Vec::new(),
            next_token: 1,
        }
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            ready: self.ready.len(),
            leased: self.leased.len(),
            dead_lettered: self.dead.len(),
        }
    }
}

/// Move one message to the dead-letter channel. Returns the message so the
/// caller can raise the terminal failure event after releasing the lock.
async fn move_to_dead(
    state: &mut QueueState,
    storage: &dyn Storage,
    id: MessageId,
) -> Result<Option<QueueMessage>, EngineError> {
    let Some(message) = state.messages.get(&id).cloned() else {
        return Ok(None);
    };
    storage.delete(&msg_key(id)).await?;
    storage.put(&dlq_key(id), serde_json::to_vec(&message)?).await?;
    state.dead.push(id);
    Ok(Some(message))
}

/// Durable queue store.
///
/// Visibility is enforced lazily: expired leases are reaped at the start of
/// each `lease` call, which makes the lease timeout the sole liveness
/// mechanism for stalled or crashed workers.
pub struct DurableQueue {
    storage: Arc<dyn Storage>,
    ids: Arc<dyn IdGenerator>,
    state: Arc<Mutex<QueueState>>,
    dead_letter_tx: mpsc::UnboundedSender<QueueMessage>,
}

impl DurableQueue {
    /// Open the queue over `storage`, rebuilding the index from a scan.
    /// Returns the queue plus the stream of dead-lettered messages; the
    /// engine consumes the stream to fail the owning jobs.
    pub async fn open(
        storage: Arc<dyn Storage>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<QueueMessage>), EngineError> {
        let mut state = QueueState::new();

        // Message keys embed fixed-width ULIDs, so the scan comes back in
        // enqueue order (best-effort FIFO).
        let (start, end) = prefix_range(MSG_PREFIX);
        for (_, bytes) in storage.scan_range(&start, &end).await? {
            let mut message: QueueMessage = serde_json::from_slice(&bytes)?;
            message.lease_expires_at = None; // a crash drops leases
            state.ready.push_back(message.id);
            state.messages.insert(message.id, message);
        }

        let (start, end) = prefix_range(DLQ_PREFIX);
        for (_, bytes) in storage.scan_range(&start, &end).await? {
            let message: QueueMessage = serde_json::from_slice(&bytes)?;
            state.dead.push(message.id);
            state.messages.insert(message.id, message);
        }

        let (dead_letter_tx, dead_letter_rx) = mpsc::unbounded_channel();
        let queue = Self {
            storage,
            ids,
            state: Arc::new(Mutex::new(state)),
            dead_letter_tx,
        };
        Ok((queue, dead_letter_rx))
    }

    /// Reap expired leases: the message becomes visible again at the front
    /// of the ready set with `attempt_count` incremented, or dead-letters
    /// once the count exceeds its threshold.
    async fn reap_expired(
        &self,
        state: &mut QueueState,
    ) -> Result<Vec<QueueMessage>, EngineError> {
        let now = Instant::now();
        let expired: Vec<MessageId> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut dead = Vec::new();
        for id in expired {
            state.leased.remove(&id);
            let Some(message) = state.messages.get_mut(&id) else {
                continue;
            };
            message.lease_expires_at = None;
            message.attempt_count += 1;

            if message.attempt_count > message.dlq_threshold {
                tracing::warn!(message_id = %id, attempts = message.attempt_count, "lease expired, retry budget exhausted");
                if let Some(message) = move_to_dead(state, self.storage.as_ref(), id).await? {
                    dead.push(message);
                }
            } else {
                tracing::debug!(message_id = %id, attempts = message.attempt_count, "lease expired, requeueing");
                let message = message.clone();
                self.storage
                    .put(&msg_key(id), serde_json::to_vec(&message)?)
                    .await?;
                // Redelivery re-enters at the front of the visible set.
                state.ready.push_front(id);
            }
        }
        Ok(dead)
    }
}

#[async_trait]
impl Queue for DurableQueue {
    async fn enqueue(
        &self,
        payload: serde_json::Value,
        dlq_threshold: u32,
    ) -> Result<MessageId, EngineError> {
        let id = self.ids.message_id();
        let message = QueueMessage {
            id,
            payload,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            dlq_threshold,
            lease_expires_at: None,
        };

        let mut state = self.state.lock().await;
        self.storage
            .put(&msg_key(id), serde_json::to_vec(&message)?)
            .await?;
        state.messages.insert(id, message);
        state.ready.push_back(id);
        Ok(id)
    }

    async fn lease(
        &self,
        visibility: Duration,
    ) -> Result<Option<Box<dyn MessageLease>>, EngineError> {
        let (lease, dead) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let dead = self.reap_expired(state).await?;

            let mut lease = None;
            while let Some(id) = state.ready.pop_front() {
                let Some(message) = state.messages.get_mut(&id) else {
                    continue; // stale index entry
                };
                let token = state.next_token;
                state.next_token += 1;
                message.lease_expires_at =
                    Some(Utc::now() + chrono::Duration::from_std(visibility).unwrap_or_default());
                let message = message.clone();
                state.leased.insert(
                    id,
                    LiveLease {
                        token,
                        expires_at: Instant::now() + visibility,
                    },
                );
                lease = Some(Box::new(DurableLease {
                    message,
                    token,
                    state: Arc::clone(&self.state),
                    storage: Arc::clone(&self.storage),
                    dead_letter_tx: self.dead_letter_tx.clone(),
                }) as Box<dyn MessageLease>);
                break;
            }
            (lease, dead)
        };

        // Raise terminal failure events outside the lock.
        for message in dead {
            let _ = self.dead_letter_tx.send(message);
        }
        Ok(lease)
    }

    async fn counts(&self) -> Result<QueueCounts, EngineError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }

    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .dead
            .iter()
            .filter_map(|id| state.messages.get(id))
            .cloned()
            .collect())
    }
}

/// Lease handle writing back through the shared state.
struct DurableLease {
    message: QueueMessage,
    token: u64,
    state: Arc<Mutex<QueueState>>,
    storage: Arc<dyn Storage>,
    dead_letter_tx: mpsc::UnboundedSender<QueueMessage>,
}

impl DurableLease {
    /// The lease is live iff the stored token matches. A reaped-and-
    /// redelivered message carries a new token, so the old holder's ack/nack
    /// is rejected instead of clobbering the new lease.
    fn check_token(&self, state: &QueueState) -> Result<(), EngineError> {
        match state.leased.get(&self.message.id) {
            Some(live) if live.token == self.token => Ok(()),
            _ => Err(EngineError::StaleLease(self.message.id)),
        }
    }
}

#[async_trait]
impl MessageLease for DurableLease {
    fn message(&self) -> &QueueMessage {
        &self.message
    }

    async fn ack(self: Box<Self>) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        self.check_token(&state)?;

        let id = self.message.id;
        state.leased.remove(&id);
        state.messages.remove(&id);
        self.storage.delete(&msg_key(id)).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), EngineError> {
        let id = self.message.id;
        let dead = {
            let mut state = self.state.lock().await;
            self.check_token(&state)?;
            state.leased.remove(&id);

            let Some(message) = state.messages.get_mut(&id) else {
                return Ok(());
            };
            message.lease_expires_at = None;
            message.attempt_count += 1;

            if requeue {
                if message.attempt_count > message.dlq_threshold {
                    move_to_dead(&mut state, self.storage.as_ref(), id).await?
                } else {
                    let message = message.clone();
                    self.storage
                        .put(&msg_key(id), serde_json::to_vec(&message)?)
                        .await?;
                    state.ready.push_front(id);
                    None
                }
            } else {
                move_to_dead(&mut state, self.storage.as_ref(), id).await?
            }
        };

        if let Some(message) = dead {
            let _ = self.dead_letter_tx.send(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStorage;
    use crate::ports::{SystemClock, UlidGenerator};

    async fn open_queue(
        storage: Arc<dyn Storage>,
    ) -> (DurableQueue, mpsc::UnboundedReceiver<QueueMessage>) {
        let ids = Arc::new(UlidGenerator::new(SystemClock));
        DurableQueue::open(storage, ids).await.unwrap()
    }

    fn payload(n: u32) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[tokio::test]
    async fn lease_is_mutually_exclusive() {
        let (queue, _rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        queue.enqueue(payload(1), 3).await.unwrap();

        let first = queue.lease(Duration::from_secs(5)).await.unwrap();
        assert!(first.is_some());

        // The only message is leased; nothing else is visible.
        let second = queue.lease(Duration::from_secs(5)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn racing_consumers_never_share_a_message() {
        let (queue, _rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        for n in 0..20 {
            queue.enqueue(payload(n), 3).await.unwrap();
        }

        let queue = Arc::new(queue);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(lease) = queue.lease(Duration::from_secs(60)).await.unwrap() {
                    taken.push(lease.message().id);
                    lease.ack().await.unwrap();
                }
                taken
            }));
        }

        let mut seen = std::collections::BTreeSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "message {id} delivered to two consumers");
            }
        }
        assert_eq!(total, 20);
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn ack_removes_the_message() {
        let (queue, _rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        queue.enqueue(payload(1), 3).await.unwrap();

        let lease = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
        lease.ack().await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts, QueueCounts::default());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_with_incremented_attempts() {
        let (queue, _rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        let id = queue.enqueue(payload(1), 3).await.unwrap();

        let lease = queue.lease(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(lease.message().attempt_count, 0);
        drop(lease); // holder stalls; never acks

        tokio::time::sleep(Duration::from_millis(40)).await;

        let lease = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(lease.message().id, id);
        assert_eq!(lease.message().attempt_count, 1);
    }

    #[tokio::test]
    async fn stale_ack_is_rejected_after_redelivery() {
        let (queue, _rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        queue.enqueue(payload(1), 3).await.unwrap();

        let stale = queue.lease(Duration::from_millis(20)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Redelivery issues a new token.
        let live = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();

        let err = stale.ack().await.unwrap_err();
        assert!(matches!(err, EngineError::StaleLease(_)));

        // The live lease is unaffected.
        live.ack().await.unwrap();
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn third_failure_dead_letters_with_threshold_two() {
        let (queue, mut rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        queue.enqueue(payload(1), 2).await.unwrap();
        queue.enqueue(payload(2), 2).await.unwrap();
        queue.enqueue(payload(3), 2).await.unwrap();

        // Fail the first message three times in a row.
        let mut dead_id = None;
        for attempt in 1..=3 {
            let lease = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
            dead_id = Some(lease.message().id);
            lease.nack(true).await.unwrap();
            if attempt < 3 {
                // Still within budget: requeued at the front.
                assert_eq!(queue.counts().await.unwrap().dead_lettered, 0);
            }
        }
        let dead_id = dead_id.unwrap();

        // Appears exactly once in the dead-letter channel and on the stream.
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, dead_id);
        assert_eq!(dead[0].attempt_count, 3);
        assert_eq!(rx.recv().await.unwrap().id, dead_id);

        // Never delivered again: the remaining leases are the other two.
        let a = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
        let b = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_ne!(a.message().id, dead_id);
        assert_ne!(b.message().id, dead_id);
        assert!(queue.lease(Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters_immediately() {
        let (queue, mut rx) = open_queue(Arc::new(MemoryStorage::new())).await;
        let id = queue.enqueue(payload(1), 5).await.unwrap();

        let lease = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
        lease.nack(false).await.unwrap();

        assert_eq!(queue.counts().await.unwrap().dead_lettered, 1);
        assert_eq!(rx.recv().await.unwrap().id, id);
        assert!(queue.lease(Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopen_recovers_messages_in_enqueue_order() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first_id;
        {
            let (queue, _rx) = open_queue(Arc::clone(&storage)).await;
            first_id = queue.enqueue(payload(1), 3).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await; // distinct ULID ms
            queue.enqueue(payload(2), 3).await.unwrap();
            // Leave one leased: the "crash" drops the lease.
            let _lease = queue.lease(Duration::from_secs(60)).await.unwrap().unwrap();
        }

        let (queue, _rx) = open_queue(storage).await;
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.ready, 2);
        assert_eq!(counts.leased, 0);

        let lease = queue.lease(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(lease.message().id, first_id);
    }
}
