//! Pub/sub fan-out
//!
//! A publish delivers to the subscriber set as it stands when the topic lock
//! is taken. Sends are `try_send` on each subscriber's bounded channel: a full
//! channel loses that one delivery and bumps the topic's failure counter, a
//! closed channel also prunes the subscriber. Nothing is reported back to the
//! publisher.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::broker::topic::PubSubTopic;
use crate::session::{DeliveryError, SessionHandle, SessionId};

/// Outcome of one fan-out, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

#[derive(Debug, Default)]
pub struct PubSubDispatcher;

impl PubSubDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Fan `message` out to the current subscribers. `None` if the topic was
    /// retired before the lock was taken.
    pub fn publish(&self, topic: &PubSubTopic, message: Arc<Message>) -> Option<FanOut> {
        let mut outcome = FanOut::default();
        let mut closed: Vec<SessionId> = Vec::new();

        let mut state = topic.state.lock();
        if state.is_retired() {
            return None;
        }
        state.remember(Arc::clone(&message), topic.replay_window);

        for (id, subscriber) in &state.subscribers {
            match subscriber.try_deliver(Arc::clone(&message)) {
                Ok(()) => outcome.delivered += 1,
                Err(DeliveryError::Full) => {
                    outcome.dropped += 1;
                    debug!("Dropped {} for slow subscriber {id} on '{}'", message.id, topic.name);
                }
                Err(DeliveryError::Closed) => {
                    outcome.dropped += 1;
                    closed.push(id.clone());
                }
            }
        }

        for id in closed {
            state.subscribers.remove(&id);
            outcome.pruned += 1;
            warn!("Pruned closed subscriber {id} from topic '{}'", topic.name);
        }

        if outcome.dropped > 0 {
            topic
                .delivery_failures
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }
        Some(outcome)
    }

    /// Send the retained window to `session` and subscribe it, in one critical
    /// section so no publish can slip between the two. Returns the number of
    /// replayed messages, or `None` if the topic was retired.
    ///
    /// A session that is already subscribed gets nothing replayed.
    pub fn subscribe_with_replay(
        &self,
        topic: &PubSubTopic,
        session: SessionHandle,
    ) -> Option<usize> {
        let mut state = topic.state.lock();
        if state.is_retired() {
            return None;
        }
        if state.subscribers.contains_key(&session.id) {
            return Some(0);
        }

        let mut replayed = 0;
        for message in &state.history {
            match session.try_deliver(Arc::clone(message)) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    topic.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Replay of '{}' to {} stopped at {} after {replayed} message(s): {e:?}",
                        topic.name, session.id, message.id
                    );
                    break;
                }
            }
        }
        state.subscribers.insert(session.id.clone(), session);
        Some(replayed)
    }
}
