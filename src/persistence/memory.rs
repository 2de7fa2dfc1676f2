use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MessageStore, StoreError};
use crate::broker::message::{Message, MessageId};

#[derive(Debug, Default)]
struct TopicLog {
    records: BTreeMap<u64, Message>,
    index: HashMap<MessageId, u64>,
}

/// Non-durable store with the same ordering and removal contract as `SledStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    topics: Mutex<HashMap<String, TopicLog>>,
    next_key: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records held for `topic`.
    pub fn record_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.records.len())
    }

    pub fn contains(&self, topic: &str, message_id: &str) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|log| log.index.contains_key(message_id))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist(&self, message: &Message) -> Result<(), StoreError> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock();
        let log = topics.entry(message.topic.clone()).or_default();
        log.records.insert(key, message.clone());
        log.index.insert(message.id.clone(), key);
        Ok(())
    }

    async fn remove(&self, topic: &str, message_id: &str) -> Result<(), StoreError> {
        let mut topics = self.topics.lock();
        let drained = match topics.get_mut(topic) {
            Some(log) => {
                if let Some(key) = log.index.remove(message_id) {
                    log.records.remove(&key);
                }
                log.records.is_empty()
            }
            None => false,
        };
        if drained {
            topics.remove(topic);
        }
        Ok(())
    }

    async fn load_all(&self, topic: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .topics
            .lock()
            .get(topic)
            .map(|log| log.records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn topics(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .topics
            .lock()
            .iter()
            .filter(|(_, log)| !log.records.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}
