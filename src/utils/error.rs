//! The `error` module defines the error types shared by the broker core,
//! the persistence layer and the transports.
//!
//! `BrokerError` is what broker operations return. Every variant maps onto a
//! wire-level [`ErrorKind`], which is the only part a client ever sees.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::StoreError;

/// Error classes reported to clients in `{"type": "error"}` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidTopic,
    InvalidMode,
    InvalidPayload,
    QueueFull,
    UnknownMessageId,
    PersistenceFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTopic => "InvalidTopic",
            ErrorKind::InvalidMode => "InvalidMode",
            ErrorKind::InvalidPayload => "InvalidPayload",
            ErrorKind::QueueFull => "QueueFull",
            ErrorKind::UnknownMessageId => "UnknownMessageId",
            ErrorKind::PersistenceFailure => "PersistenceFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("queue `{topic}` is full (capacity {capacity})")]
    QueueFull { topic: String, capacity: usize },

    #[error("message `{0}` is not in flight")]
    UnknownMessageId(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::InvalidTopic(_) => ErrorKind::InvalidTopic,
            BrokerError::InvalidMode(_) => ErrorKind::InvalidMode,
            BrokerError::InvalidPayload(_) => ErrorKind::InvalidPayload,
            BrokerError::QueueFull { .. } => ErrorKind::QueueFull,
            BrokerError::UnknownMessageId(_) => ErrorKind::UnknownMessageId,
            BrokerError::Persistence(_) => ErrorKind::PersistenceFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
