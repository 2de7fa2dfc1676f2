//! Wire protocol
//!
//! One JSON object per frame (a line on TCP, a text frame on WebSocket).
//!
//! Requests: `{"action": "publish"|"subscribe"|"unsubscribe"|"ack"|"nack",
//! "topic": str, "mode": "pubsub"|"queue", "payload"?: any,
//! "message_id"?: str, "replay"?: bool}`.
//!
//! `mode` defaults to `pubsub`, except for `ack`/`nack` which only exist for
//! queues and default to `queue`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::{Message, MessageId, Mode};
use crate::utils::{BrokerError, ErrorKind};

#[derive(Debug, Deserialize)]
struct RawRequest {
    action: String,
    topic: Option<String>,
    mode: Option<String>,
    payload: Option<Value>,
    message_id: Option<String>,
    #[serde(default)]
    replay: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Publish {
        topic: String,
        mode: Mode,
        payload: Value,
    },
    Subscribe {
        topic: String,
        mode: Mode,
        replay: bool,
    },
    Unsubscribe {
        topic: String,
        mode: Mode,
    },
    Ack {
        topic: String,
        message_id: MessageId,
    },
    Nack {
        topic: String,
        message_id: MessageId,
    },
}

impl Request {
    /// Decode and validate one frame.
    pub fn parse(text: &str) -> Result<Self, BrokerError> {
        let raw: RawRequest = serde_json::from_str(text)
            .map_err(|e| BrokerError::InvalidPayload(format!("malformed request: {e}")))?;

        let topic = raw
            .topic
            .ok_or_else(|| BrokerError::InvalidTopic("missing topic".to_string()))?;

        match raw.action.as_str() {
            "publish" => {
                let payload = raw.payload.ok_or_else(|| {
                    BrokerError::InvalidPayload("publish requires a payload".to_string())
                })?;
                Ok(Request::Publish {
                    topic,
                    mode: parse_mode(raw.mode.as_deref(), Mode::PubSub)?,
                    payload,
                })
            }
            "subscribe" => Ok(Request::Subscribe {
                topic,
                mode: parse_mode(raw.mode.as_deref(), Mode::PubSub)?,
                replay: raw.replay,
            }),
            "unsubscribe" => Ok(Request::Unsubscribe {
                topic,
                mode: parse_mode(raw.mode.as_deref(), Mode::PubSub)?,
            }),
            action @ ("ack" | "nack") => {
                if parse_mode(raw.mode.as_deref(), Mode::Queue)? != Mode::Queue {
                    return Err(BrokerError::InvalidMode(format!(
                        "{action} is only valid for queue topics"
                    )));
                }
                let message_id = raw
                    .message_id
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        BrokerError::InvalidPayload(format!("{action} requires a message_id"))
                    })?;
                if action == "ack" {
                    Ok(Request::Ack { topic, message_id })
                } else {
                    Ok(Request::Nack { topic, message_id })
                }
            }
            other => Err(BrokerError::InvalidPayload(format!(
                "unknown action `{other}`"
            ))),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Request::Ack { message_id, .. } | Request::Nack { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

fn parse_mode(mode: Option<&str>, default: Mode) -> Result<Mode, BrokerError> {
    mode.map_or(Ok(default), |m| m.parse::<Mode>())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Publish accepted.
    Ack { message_id: MessageId },
    /// A delivered message. Queue deliveries must be answered with ack/nack.
    Message {
        topic: String,
        message_id: MessageId,
        payload: Value,
        mode: Mode,
    },
    Error {
        error: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ServerMessage {
    pub fn delivery(message: &Message) -> Self {
        ServerMessage::Message {
            topic: message.topic.clone(),
            message_id: message.id.clone(),
            payload: message.payload.clone(),
            mode: message.mode,
        }
    }

    pub fn error(err: &BrokerError, message_id: Option<&str>) -> Self {
        ServerMessage::Error {
            error: err.kind(),
            message_id: message_id.map(str::to_string),
            detail: Some(err.to_string()),
        }
    }
}
