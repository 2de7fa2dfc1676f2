//! Session handle
//!
//! `SessionHandle` is what the registry stores for a subscriber or consumer:
//! the session id and the sending side of the session's bounded outbound
//! channel. Dispatchers only ever use `try_deliver`, so a slow client can
//! never stall delivery on a topic.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::transport::message::ServerMessage;

pub type SessionId = String;

/// Item carried by a session's outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A message pushed by a dispatcher.
    Deliver(Arc<Message>),
    /// A response to one of the session's own requests.
    Reply(ServerMessage),
}

impl From<Outbound> for ServerMessage {
    fn from(outbound: Outbound) -> Self {
        match outbound {
            Outbound::Deliver(message) => ServerMessage::delivery(&message),
            Outbound::Reply(reply) => reply,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound buffer is at capacity.
    Full,
    /// The session's receiver is gone.
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    sender: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    /// Create a handle with a fresh UUID around an existing sender.
    pub fn new(sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
        }
    }

    /// Create a handle together with its bounded outbound channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn try_deliver(&self, message: Arc<Message>) -> Result<(), DeliveryError> {
        self.sender
            .try_send(Outbound::Deliver(message))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Queue a reply, waiting for buffer space. Returns false once the
    /// session is gone.
    pub async fn reply(&self, reply: ServerMessage) -> bool {
        self.sender.send(Outbound::Reply(reply)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
