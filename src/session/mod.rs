//! The `session` module represents a connected client.
//!
//! `SessionHandle` is the cheap, cloneable part the broker keeps in topic
//! state; `Session` is the per-connection protocol state machine that owns
//! the handle and tears everything down when the connection ends.

pub mod connection;
pub mod handle;

pub use connection::{Session, SessionState};
pub use handle::{DeliveryError, Outbound, SessionHandle, SessionId};
