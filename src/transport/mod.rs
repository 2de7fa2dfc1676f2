//! The `transport` module is responsible for network communication with
//! clients.
//!
//! It defines the JSON wire protocol and serves it two ways: newline-delimited
//! over plain TCP (the primary listener) and as WebSocket text frames. Both
//! listeners hand every connection to a `Session` and share the same
//! connection limit and shutdown signal.

pub mod message;
pub mod tcp;
pub mod websocket;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::transport::message::ServerMessage;

/// State shared by every listener.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub broker: Arc<Broker>,
    pub connections: Arc<Semaphore>,
    pub max_frame_bytes: usize,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(
        broker: Arc<Broker>,
        max_connections: usize,
        max_frame_bytes: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
            max_frame_bytes,
            shutdown,
        }
    }
}

pub fn encode(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests;
