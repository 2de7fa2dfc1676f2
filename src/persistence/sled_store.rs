//! Persistence layer backed by `sled`
//!
//! Every queue topic owns two trees:
//! - `queue:<topic>` maps a big-endian id from `Db::generate_id` to the JSON
//!   encoded message, so iteration yields messages in enqueue order
//! - `index:<topic>` maps the message id to that key, for removal on ack
//!
//! Both trees are updated in one transaction, and both are dropped once the
//! last record of the topic is removed. With `sync_writes` every
//! persist/remove waits for `flush_async` before returning.

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, warn};

use super::{MessageStore, StoreError};
use crate::broker::message::Message;

const RECORDS_PREFIX: &str = "queue:";
const INDEX_PREFIX: &str = "index:";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    sync_writes: bool,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str, sync_writes: bool) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db, sync_writes })
    }

    fn trees(&self, topic: &str) -> Result<(Tree, Tree), StoreError> {
        let records = self.db.open_tree(format!("{RECORDS_PREFIX}{topic}"))?;
        let index = self.db.open_tree(format!("{INDEX_PREFIX}{topic}"))?;
        Ok((records, index))
    }

    fn drop_trees(&self, topic: &str) -> Result<(), StoreError> {
        self.db.drop_tree(format!("{RECORDS_PREFIX}{topic}"))?;
        self.db.drop_tree(format!("{INDEX_PREFIX}{topic}"))?;
        debug!("Dropped drained queue trees for '{topic}'");
        Ok(())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        if self.sync_writes {
            self.db.flush_async().await?;
        }
        Ok(())
    }
}

fn transaction_error(err: TransactionError<()>) -> StoreError {
    match err {
        TransactionError::Storage(e) => StoreError::Sled(e),
        TransactionError::Abort(()) => StoreError::Transaction("aborted".to_string()),
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn persist(&self, message: &Message) -> Result<(), StoreError> {
        let (records, index) = self.trees(&message.topic)?;
        let key = self.db.generate_id()?.to_be_bytes();
        let value = serde_json::to_vec(message)?;

        (&records, &index)
            .transaction(|(records, index)| {
                records.insert(&key[..], value.clone())?;
                index.insert(message.id.as_bytes(), &key[..])?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(transaction_error)?;

        self.sync().await
    }

    async fn remove(&self, topic: &str, message_id: &str) -> Result<(), StoreError> {
        let (records, index) = self.trees(topic)?;

        let removed = (&records, &index)
            .transaction(|(records, index)| {
                match index.remove(message_id.as_bytes())? {
                    Some(key) => {
                        records.remove(key)?;
                        Ok::<bool, ConflictableTransactionError<()>>(true)
                    }
                    None => Ok(false),
                }
            })
            .map_err(transaction_error)?;

        let drained = records.is_empty();
        drop((records, index));
        if drained {
            self.drop_trees(topic)?;
        }
        if removed {
            self.sync().await?;
        }
        Ok(())
    }

    async fn load_all(&self, topic: &str) -> Result<Vec<Message>, StoreError> {
        let (records, _) = self.trees(topic)?;
        let mut messages = Vec::with_capacity(records.len());

        for entry in records.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<Message>(&value) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping unreadable record {key:?} in queue '{topic}': {e}"),
            }
        }
        Ok(messages)
    }

    async fn topics(&self) -> Result<Vec<String>, StoreError> {
        let mut topics = Vec::new();
        for name in self.db.tree_names() {
            let Ok(name) = std::str::from_utf8(&name) else {
                continue;
            };
            if let Some(topic) = name.strip_prefix(RECORDS_PREFIX) {
                if !self.db.open_tree(name)?.is_empty() {
                    topics.push(topic.to_string());
                }
            }
        }
        Ok(topics)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}
