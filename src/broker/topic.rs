//! Topic state
//!
//! A topic is identified by `(name, mode)`. Pub/sub and queue topics with the
//! same name are unrelated.
//!
//! - `PubSubTopic` keeps the live subscriber set and a bounded replay window,
//!   behind a synchronous lock that is never held across an await.
//! - `QueueTopic` keeps the FIFO backlog, the in-flight map and the consumer
//!   rotation behind an async lock, because the queue dispatcher awaits the
//!   store while holding it. That lock is the single-writer discipline for
//!   the topic: assignment, requeue and capacity checks each happen inside
//!   one critical section.
//!
//! A topic with no members and nothing retained is retired under its own lock
//! and dropped from the registry. Callers that looked up a topic before it was
//! retired see `is_retired()` once they hold the lock and look it up again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::broker::message::{Message, MessageId, Mode};
use crate::session::{SessionHandle, SessionId};
use crate::utils::BrokerError;

pub const MAX_TOPIC_NAME_BYTES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey {
    pub name: String,
    pub mode: Mode,
}

impl TopicKey {
    pub fn new(name: &str, mode: Mode) -> Self {
        Self {
            name: name.to_string(),
            mode,
        }
    }
}

pub fn validate_topic_name(name: &str) -> Result<(), BrokerError> {
    if name.is_empty() {
        return Err(BrokerError::InvalidTopic("topic name is empty".to_string()));
    }
    if name.len() > MAX_TOPIC_NAME_BYTES {
        return Err(BrokerError::InvalidTopic(format!(
            "topic name exceeds {MAX_TOPIC_NAME_BYTES} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(BrokerError::InvalidTopic(
            "topic name contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Read-only counters for monitoring. Never used for delivery decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicSnapshot {
    pub backlog_depth: usize,
    pub in_flight_depth: usize,
    pub subscriber_count: usize,
    pub consumer_count: usize,
    pub delivery_failures: u64,
    pub replay_depth: usize,
}

#[derive(Debug, Clone)]
pub enum TopicHandle {
    PubSub(Arc<PubSubTopic>),
    Queue(Arc<QueueTopic>),
}

impl TopicHandle {
    pub fn name(&self) -> &str {
        match self {
            TopicHandle::PubSub(topic) => &topic.name,
            TopicHandle::Queue(topic) => &topic.name,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            TopicHandle::PubSub(_) => Mode::PubSub,
            TopicHandle::Queue(_) => Mode::Queue,
        }
    }
}

// ---------------------------------------------------------------------------
// Pub/sub
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PubSubState {
    pub subscribers: HashMap<SessionId, SessionHandle>,
    pub history: VecDeque<Arc<Message>>,
    retired: bool,
}

impl PubSubState {
    /// No subscribers and no replay history.
    pub fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.history.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Keep `message` in the replay window, evicting the oldest beyond `window`.
    pub fn remember(&mut self, message: Arc<Message>, window: usize) {
        if window == 0 {
            return;
        }
        self.history.push_back(message);
        while self.history.len() > window {
            self.history.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct PubSubTopic {
    pub name: String,
    pub replay_window: usize,
    pub state: Mutex<PubSubState>,
    pub delivery_failures: AtomicU64,
}

impl PubSubTopic {
    pub fn new(name: &str, replay_window: usize) -> Self {
        Self {
            name: name.to_string(),
            replay_window,
            state: Mutex::new(PubSubState::default()),
            delivery_failures: AtomicU64::new(0),
        }
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        let state = self.state.lock();
        TopicSnapshot {
            subscriber_count: state.subscribers.len(),
            replay_depth: state.history.len(),
            delivery_failures: self.delivery_failures(),
            ..TopicSnapshot::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A backlog entry. `attempts` counts previous deliveries.
#[derive(Debug, Clone)]
pub struct Pending {
    pub message: Arc<Message>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub message: Arc<Message>,
    pub session: SessionId,
    pub delivered_at: Instant,
    pub deadline: Instant,
    pub attempts: u32,
    seq: u64,
}

#[derive(Debug)]
pub struct Consumer {
    pub handle: SessionHandle,
    pub outstanding: usize,
}

/// Backlog, in-flight map and consumer rotation of one queue topic.
///
/// Every queued message id is in exactly one of `backlog` and `in_flight`.
#[derive(Debug)]
pub struct QueueState {
    pub backlog: VecDeque<Pending>,
    pub in_flight: HashMap<MessageId, InFlight>,
    pub consumers: Vec<Consumer>,
    cursor: usize,
    capacity: usize,
    next_seq: u64,
    retired: bool,
}

impl QueueState {
    pub fn new(capacity: usize) -> Self {
        Self {
            backlog: VecDeque::new(),
            in_flight: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
            capacity,
            next_seq: 0,
            retired: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.backlog.len() >= self.capacity
    }

    /// Append to the backlog if capacity allows.
    pub fn enqueue(&mut self, message: Arc<Message>) -> bool {
        if self.is_full() {
            return false;
        }
        self.backlog.push_back(Pending {
            message,
            attempts: 0,
        });
        true
    }

    /// Append recovered messages regardless of capacity. Ids already known to
    /// this topic are ignored.
    pub fn restore(&mut self, messages: Vec<Arc<Message>>) -> usize {
        let mut known: HashSet<MessageId> = self
            .backlog
            .iter()
            .map(|p| p.message.id.clone())
            .chain(self.in_flight.keys().cloned())
            .collect();

        let mut restored = 0;
        for message in messages {
            if known.insert(message.id.clone()) {
                self.backlog.push_back(Pending {
                    message,
                    attempts: 0,
                });
                restored += 1;
            }
        }
        restored
    }

    /// Nothing queued, nothing in flight and no consumers.
    pub fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.in_flight.is_empty() && self.consumers.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn attach_consumer(&mut self, handle: SessionHandle) -> bool {
        if self.consumers.iter().any(|c| c.handle.id == handle.id) {
            return false;
        }
        self.consumers.push(Consumer {
            handle,
            outstanding: 0,
        });
        true
    }

    /// Remove a consumer and requeue everything in flight to it. Returns the
    /// number of requeued messages; detaching an unknown session is a no-op.
    pub fn detach_consumer(&mut self, session: &str) -> usize {
        if let Some(idx) = self.consumers.iter().position(|c| c.handle.id == session) {
            self.consumers.remove(idx);
            if self.cursor > idx {
                self.cursor -= 1;
            }
            if self.cursor >= self.consumers.len() {
                self.cursor = 0;
            }
        }

        let owned: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(id, _)| id.clone())
            .collect();
        let entries = owned
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .collect();
        self.requeue_front(entries)
    }

    pub fn is_in_flight_to(&self, message_id: &str, session: &str) -> bool {
        self.in_flight
            .get(message_id)
            .is_some_and(|entry| entry.session == session)
    }

    /// Drop an acknowledged message and free its consumer slot.
    pub fn complete(&mut self, message_id: &str) -> Option<InFlight> {
        let entry = self.in_flight.remove(message_id)?;
        self.release_slot(&entry.session);
        Some(entry)
    }

    /// Move one in-flight message back to the front of the backlog.
    pub fn requeue(&mut self, message_id: &str) -> bool {
        match self.in_flight.remove(message_id) {
            Some(entry) => {
                self.release_slot(&entry.session);
                self.requeue_front(vec![entry]);
                true
            }
            None => false,
        }
    }

    /// Requeue every in-flight message whose ack deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut entries = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(entry) = self.in_flight.remove(id) {
                self.release_slot(&entry.session);
                entries.push(entry);
            }
        }
        self.requeue_front(entries)
    }

    /// Index of the next consumer in rotation with a free slot, skipping
    /// `skip`.
    pub fn next_consumer(&self, prefetch: usize, skip: &HashSet<SessionId>) -> Option<usize> {
        let n = self.consumers.len();
        (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&idx| {
                let consumer = &self.consumers[idx];
                consumer.outstanding < prefetch && !skip.contains(&consumer.handle.id)
            })
    }

    /// Record a delivery made to the consumer at `idx` and advance the rotation.
    pub fn assign(&mut self, idx: usize, pending: Pending, now: Instant, deadline: Instant) {
        let consumer = &mut self.consumers[idx];
        consumer.outstanding += 1;
        let session = consumer.handle.id.clone();
        self.cursor = (idx + 1) % self.consumers.len();

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(
            pending.message.id.clone(),
            InFlight {
                message: pending.message,
                session,
                delivered_at: now,
                deadline,
                attempts: pending.attempts + 1,
                seq,
            },
        );
    }

    pub fn outstanding_for(&self, session: &str) -> usize {
        self.in_flight
            .values()
            .filter(|entry| entry.session == session)
            .count()
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        TopicSnapshot {
            backlog_depth: self.backlog.len(),
            in_flight_depth: self.in_flight.len(),
            consumer_count: self.consumers.len(),
            ..TopicSnapshot::default()
        }
    }

    fn release_slot(&mut self, session: &str) {
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.handle.id == session) {
            consumer.outstanding = consumer.outstanding.saturating_sub(1);
        }
    }

    /// Push entries to the front of the backlog, oldest delivery first.
    fn requeue_front(&mut self, mut entries: Vec<InFlight>) -> usize {
        entries.sort_by_key(|entry| entry.seq);
        let count = entries.len();
        for entry in entries.into_iter().rev() {
            self.backlog.push_front(Pending {
                message: entry.message,
                attempts: entry.attempts,
            });
        }
        count
    }
}

#[derive(Debug)]
pub struct QueueTopic {
    pub name: String,
    pub state: tokio::sync::Mutex<QueueState>,
}

impl QueueTopic {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            state: tokio::sync::Mutex::new(QueueState::new(capacity)),
        }
    }

    pub async fn snapshot(&self) -> TopicSnapshot {
        self.state.lock().await.snapshot()
    }
}
