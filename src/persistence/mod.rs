//! The `persistence` module keeps queue-mode messages durable until they are
//! acknowledged, and hands them back at startup.
//!
//! The broker only talks to the [`MessageStore`] trait. Two backends exist:
//! `sled` (the default, one tree per queue topic) and an in-memory store that
//! offers the same contract without durability.

pub mod memory;
pub mod sled_store;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::message::Message;
use crate::config::{PersistenceSettings, StoreBackend};

pub use memory::MemoryStore;
pub use sled_store::SledStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable record of every queued, not yet acknowledged message.
///
/// Calls for different topics may run concurrently; calls for one topic are
/// serialized by the caller.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Returns once the message is durable.
    async fn persist(&self, message: &Message) -> Result<(), StoreError>;

    /// Removes the record for `message_id`. Removing an absent id is not an error.
    async fn remove(&self, topic: &str, message_id: &str) -> Result<(), StoreError>;

    /// All records for `topic`, in the order they were persisted.
    async fn load_all(&self, topic: &str) -> Result<Vec<Message>, StoreError>;

    /// Topics that currently hold at least one record.
    async fn topics(&self) -> Result<Vec<String>, StoreError>;

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Open the backend selected in `settings`.
pub fn open_store(settings: &PersistenceSettings) -> Result<Arc<dyn MessageStore>, StoreError> {
    match settings.backend {
        StoreBackend::Sled => Ok(Arc::new(SledStore::open(
            &settings.path,
            settings.sync_writes,
        )?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(test)]
mod tests;
