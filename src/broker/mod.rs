//! The `broker` module is the routing and delivery engine: topic state, the
//! registry, pub/sub fan-out, the queue dispatcher and the `Broker` facade
//! that sessions talk to.

pub mod engine;
pub mod message;
pub mod pubsub;
pub mod queue;
pub mod registry;
pub mod topic;

pub use engine::Broker;
pub use message::{Message, MessageId, Mode};
pub use topic::{TopicKey, TopicSnapshot};
