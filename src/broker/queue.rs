//! Queue dispatcher
//!
//! Point-to-point delivery with at-least-once semantics. Per message:
//! `Queued -> Dispatched -> Acknowledged`, and back to `Queued` on nack, ack
//! timeout, or consumer detach. Requeued messages go to the front of the
//! backlog.
//!
//! Every operation here takes the topic lock once and does all of its work,
//! including the store call and the following dispatch cycle, before
//! releasing it. A consumer that disconnects while a message is being
//! assigned to it therefore either has the message recorded as in flight
//! (and requeued by its detach) or never sees it.
//!
//! Operations that can bring a queue to life (publish, restore, attach) look
//! the topic up through the registry and retry if they land on a retired one.
//! Detach and the sweeper retire a queue that has become idle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::message::Message;
use crate::broker::registry::Registry;
use crate::broker::topic::{QueueState, QueueTopic};
use crate::persistence::MessageStore;
use crate::session::{DeliveryError, SessionHandle, SessionId};
use crate::utils::BrokerError;
use crate::utils::error::Result;

#[derive(Debug)]
pub struct QueueDispatcher {
    store: Arc<dyn MessageStore>,
    ack_timeout: Duration,
    prefetch: usize,
}

impl QueueDispatcher {
    pub fn new(store: Arc<dyn MessageStore>, ack_timeout: Duration, prefetch: usize) -> Self {
        Self {
            store,
            ack_timeout,
            prefetch: prefetch.max(1),
        }
    }

    /// Persist and enqueue `message` on queue `name`, then run a dispatch
    /// cycle.
    ///
    /// Fails with `QueueFull` when the backlog is at capacity and with
    /// `Persistence` when the store rejects the write; in both cases nothing
    /// is queued.
    pub async fn publish(
        &self,
        registry: &Registry,
        name: &str,
        message: Message,
    ) -> Result<Arc<Message>> {
        let message = Arc::new(message);
        loop {
            let topic = registry.ensure_queue(name)?;
            let mut state = topic.state.lock().await;
            if state.is_retired() {
                continue;
            }
            if state.is_full() {
                return Err(BrokerError::QueueFull {
                    topic: topic.name.clone(),
                    capacity: state.capacity(),
                });
            }

            if let Err(e) = self.store.persist(&message).await {
                registry.retire_queue_locked(&topic, &mut state);
                return Err(e.into());
            }

            let accepted = state.enqueue(Arc::clone(&message));
            debug_assert!(accepted, "capacity is checked under the same lock");

            self.dispatch(&topic.name, &mut state);
            return Ok(message);
        }
    }

    /// Put recovered messages back into the backlog of queue `name`.
    pub async fn restore(
        &self,
        registry: &Registry,
        name: &str,
        messages: Vec<Message>,
    ) -> Result<usize> {
        let messages: Vec<Arc<Message>> = messages.into_iter().map(Arc::new).collect();
        loop {
            let topic = registry.ensure_queue(name)?;
            let mut state = topic.state.lock().await;
            if state.is_retired() {
                continue;
            }
            let restored = state.restore(messages);
            self.dispatch(&topic.name, &mut state);
            registry.retire_queue_locked(&topic, &mut state);
            return Ok(restored);
        }
    }

    /// Start consuming queue `name`. Returns false if `session` already was
    /// a consumer.
    pub async fn attach_consumer(
        &self,
        registry: &Registry,
        name: &str,
        session: SessionHandle,
    ) -> Result<bool> {
        loop {
            let topic = registry.ensure_queue(name)?;
            let mut state = topic.state.lock().await;
            if state.is_retired() {
                continue;
            }
            let attached = state.attach_consumer(session);
            self.dispatch(&topic.name, &mut state);
            return Ok(attached);
        }
    }

    /// Detach a consumer, requeue whatever it held, and hand that work to the
    /// remaining consumers. Returns the number of requeued messages.
    pub async fn detach_consumer(
        &self,
        registry: &Registry,
        topic: &QueueTopic,
        session: &SessionId,
    ) -> usize {
        let mut state = topic.state.lock().await;
        let requeued = state.detach_consumer(session);
        if requeued > 0 {
            info!("Requeued {requeued} message(s) from {session} on queue '{}'", topic.name);
        }
        self.dispatch(&topic.name, &mut state);
        registry.retire_queue_locked(topic, &mut state);
        requeued
    }

    /// Acknowledge a message in flight to `session`.
    ///
    /// The durable record is removed first; if that fails the message stays
    /// in flight, so it is redelivered rather than lost.
    pub async fn ack(&self, topic: &QueueTopic, message_id: &str, session: &SessionId) -> Result<()> {
        let mut state = topic.state.lock().await;
        if !state.is_in_flight_to(message_id, session) {
            return Err(BrokerError::UnknownMessageId(message_id.to_string()));
        }

        self.store.remove(&topic.name, message_id).await?;

        if let Some(entry) = state.complete(message_id) {
            debug!(
                "Message {message_id} acknowledged on '{}' after {:?}",
                topic.name,
                entry.delivered_at.elapsed()
            );
        }
        self.dispatch(&topic.name, &mut state);
        Ok(())
    }

    /// Return a message in flight to `session` to the front of the backlog.
    pub async fn nack(&self, topic: &QueueTopic, message_id: &str, session: &SessionId) -> Result<()> {
        let mut state = topic.state.lock().await;
        if !state.is_in_flight_to(message_id, session) {
            return Err(BrokerError::UnknownMessageId(message_id.to_string()));
        }
        state.requeue(message_id);
        self.dispatch(&topic.name, &mut state);
        Ok(())
    }

    /// Requeue messages whose ack deadline passed, run a dispatch cycle and
    /// retire the queue if nothing is left in it.
    pub async fn expire_overdue(&self, registry: &Registry, topic: &QueueTopic) -> usize {
        let mut state = topic.state.lock().await;
        let expired = state.expire(Instant::now());
        if expired > 0 {
            info!("Ack timeout: requeued {expired} message(s) on queue '{}'", topic.name);
        }
        self.dispatch(&topic.name, &mut state);
        registry.retire_queue_locked(topic, &mut state);
        expired
    }

    pub async fn outstanding_for(&self, topic: &QueueTopic, session: &str) -> usize {
        topic.state.lock().await.outstanding_for(session)
    }

    /// Assign backlog heads to consumers in rotation until the backlog is
    /// empty or no consumer can take more. Returns the number of assignments.
    fn dispatch(&self, topic: &str, state: &mut QueueState) -> usize {
        let now = Instant::now();
        let deadline = now + self.ack_timeout;
        let mut assigned = 0;
        let mut skipped: HashSet<SessionId> = HashSet::new();

        while !state.backlog.is_empty() {
            let Some(idx) = state.next_consumer(self.prefetch, &skipped) else {
                break;
            };
            let Some(pending) = state.backlog.pop_front() else {
                break;
            };
            let consumer = state.consumers[idx].handle.clone();

            match consumer.try_deliver(Arc::clone(&pending.message)) {
                Ok(()) => {
                    if pending.attempts > 0 {
                        debug!(
                            "Redelivering {} on '{topic}' to {} (attempt {})",
                            pending.message.id,
                            consumer.id,
                            pending.attempts + 1
                        );
                    }
                    state.assign(idx, pending, now, deadline);
                    assigned += 1;
                }
                Err(DeliveryError::Full) => {
                    state.backlog.push_front(pending);
                    skipped.insert(consumer.id);
                }
                Err(DeliveryError::Closed) => {
                    state.backlog.push_front(pending);
                    let requeued = state.detach_consumer(&consumer.id);
                    warn!(
                        "Consumer {} on '{topic}' is gone; detached and requeued {requeued} message(s)",
                        consumer.id
                    );
                }
            }
        }
        assigned
    }
}
