//! `Message` is the canonical internal and persisted representation of a
//! published message.
//!
//! Notes on fields:
//! - `id`: UUIDv4 assigned by the broker at ingress; the durability and ack key
//! - `topic`: topic name used for routing
//! - `payload`: any JSON value, opaque to the broker
//! - `mode`: the namespace the message was published into
//! - `created_at`: milliseconds since UNIX epoch, set by the broker

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::BrokerError;

pub type MessageId = String;

/// Delivery semantics of a topic. Each mode is an independent namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    PubSub,
    Queue,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::PubSub => "pubsub",
            Mode::Queue => "queue",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pubsub" => Ok(Mode::PubSub),
            "queue" => Ok(Mode::Queue),
            other => Err(BrokerError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: Value,
    pub mode: Mode,
    pub created_at: i64,
}

impl Message {
    /// Build a fresh message with a broker-generated id.
    pub fn new(topic: &str, mode: Mode, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            mode,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
