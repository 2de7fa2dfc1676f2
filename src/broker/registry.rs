//! Topic registry
//!
//! Maps `(name, mode)` to topic state. The maps themselves are only locked to
//! look up or insert a topic; everything else happens under the topic's own
//! lock, so unrelated topics never contend.
//!
//! Lock order is topic lock, then map lock. Topics are dropped from the maps
//! once they become idle, so the registry only holds topics that have members
//! or retained messages.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::broker::message::Mode;
use crate::broker::topic::{
    PubSubState, PubSubTopic, QueueState, QueueTopic, TopicHandle, TopicKey, TopicSnapshot,
    validate_topic_name,
};
use crate::session::{SessionHandle, SessionId};
use crate::utils::error::Result;

#[derive(Debug)]
pub struct Registry {
    pubsub: RwLock<HashMap<String, Arc<PubSubTopic>>>,
    queues: RwLock<HashMap<String, Arc<QueueTopic>>>,
    queue_capacity: usize,
    replay_window: usize,
}

impl Registry {
    pub fn new(queue_capacity: usize, replay_window: usize) -> Self {
        Self {
            pubsub: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            queue_capacity,
            replay_window,
        }
    }

    /// Idempotent creation. The two modes are separate namespaces, so a name
    /// used in one mode never conflicts with the other.
    pub fn ensure_topic(&self, name: &str, mode: Mode) -> Result<TopicHandle> {
        match mode {
            Mode::PubSub => self.ensure_pubsub(name).map(TopicHandle::PubSub),
            Mode::Queue => self.ensure_queue(name).map(TopicHandle::Queue),
        }
    }

    pub fn ensure_pubsub(&self, name: &str) -> Result<Arc<PubSubTopic>> {
        validate_topic_name(name)?;
        if let Some(topic) = self.pubsub.read().get(name) {
            return Ok(Arc::clone(topic));
        }
        let mut topics = self.pubsub.write();
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PubSubTopic::new(name, self.replay_window)));
        Ok(Arc::clone(topic))
    }

    pub fn ensure_queue(&self, name: &str) -> Result<Arc<QueueTopic>> {
        validate_topic_name(name)?;
        if let Some(topic) = self.queues.read().get(name) {
            return Ok(Arc::clone(topic));
        }
        let mut topics = self.queues.write();
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueTopic::new(name, self.queue_capacity)));
        Ok(Arc::clone(topic))
    }

    pub fn pubsub_topic(&self, name: &str) -> Option<Arc<PubSubTopic>> {
        self.pubsub.read().get(name).cloned()
    }

    pub fn queue_topic(&self, name: &str) -> Option<Arc<QueueTopic>> {
        self.queues.read().get(name).cloned()
    }

    pub fn queue_topics(&self) -> Vec<Arc<QueueTopic>> {
        self.queues.read().values().cloned().collect()
    }

    /// Every known topic, sorted by name then mode.
    pub fn topics(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self
            .pubsub
            .read()
            .keys()
            .map(|name| TopicKey::new(name, Mode::PubSub))
            .chain(
                self.queues
                    .read()
                    .keys()
                    .map(|name| TopicKey::new(name, Mode::Queue)),
            )
            .collect();
        keys.sort();
        keys
    }

    /// Add a pub/sub subscriber. Returns whether it was newly added, or
    /// `None` when `topic` was retired and has to be looked up again.
    pub fn attach_subscriber(&self, topic: &PubSubTopic, session: SessionHandle) -> Option<bool> {
        let mut state = topic.state.lock();
        if state.is_retired() {
            return None;
        }
        if state.subscribers.contains_key(&session.id) {
            return Some(false);
        }
        state.subscribers.insert(session.id.clone(), session);
        Some(true)
    }

    /// Remove a pub/sub subscriber. No-op when absent. The topic is dropped
    /// once it has neither subscribers nor history.
    pub fn detach_subscriber(&self, topic: &str, session: &SessionId) -> bool {
        let Some(topic) = self.pubsub_topic(topic) else {
            return false;
        };
        let mut state = topic.state.lock();
        let removed = state.subscribers.remove(session).is_some();
        self.retire_pubsub_locked(&topic, &mut state);
        removed
    }

    /// Drop `topic` if it is idle. Returns true if it was retired.
    pub fn retire_pubsub(&self, topic: &PubSubTopic) -> bool {
        let mut state = topic.state.lock();
        self.retire_pubsub_locked(topic, &mut state)
    }

    fn retire_pubsub_locked(&self, topic: &PubSubTopic, state: &mut PubSubState) -> bool {
        if state.is_retired() || !state.is_idle() {
            return false;
        }
        state.retire();
        let mut topics = self.pubsub.write();
        if topics
            .get(&topic.name)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), topic))
        {
            topics.remove(&topic.name);
        }
        debug!("Retired idle pub/sub topic '{}'", topic.name);
        true
    }

    /// Drop `topic` if it is idle. The caller holds the topic lock as `state`.
    pub fn retire_queue_locked(&self, topic: &QueueTopic, state: &mut QueueState) -> bool {
        if state.is_retired() || !state.is_idle() {
            return false;
        }
        state.retire();
        let mut topics = self.queues.write();
        if topics
            .get(&topic.name)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), topic))
        {
            topics.remove(&topic.name);
        }
        debug!("Retired idle queue '{}'", topic.name);
        true
    }

    /// Read-only counters for one topic, `None` if it does not exist.
    pub async fn snapshot(&self, name: &str, mode: Mode) -> Option<TopicSnapshot> {
        match mode {
            Mode::PubSub => self.pubsub_topic(name).map(|topic| topic.snapshot()),
            Mode::Queue => match self.queue_topic(name) {
                Some(topic) => Some(topic.snapshot().await),
                None => None,
            },
        }
    }
}
