//! # msgbroker
//!
//! `msgbroker` is a small message broker offering two delivery modes per
//! topic: best-effort publish/subscribe fan-out and durable point-to-point
//! queues with explicit acknowledgment.
//!
//! ## Core Modules
//!
//! - `broker`: topic state, the registry, the pub/sub and queue dispatchers and
//!   the `Broker` facade.
//! - `session`: the per-connection protocol state machine.
//! - `config`: loading the server configuration from files and environment.
//! - `persistence`: the durable store for unacknowledged queue messages.
//! - `transport`: the wire protocol and the TCP and WebSocket listeners.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod session;
pub mod transport;
pub mod utils;
