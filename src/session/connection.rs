//! Connection session
//!
//! One `Session` per connected client, whatever the transport. The transport
//! feeds it raw frames and drains its outbound receiver; the session decodes
//! requests, calls into the broker and queues replies on the same channel the
//! dispatchers deliver on, so a client sees both in production order.
//!
//! Lifecycle: `Connected -> (Idle | AwaitingAck)* -> Closed`. `close` runs the
//! teardown exactly once, no matter how many paths (reader end, writer error,
//! server shutdown) ask for it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::broker::message::Mode;
use crate::session::handle::{Outbound, SessionHandle, SessionId};
use crate::transport::message::{Request, ServerMessage};
use crate::utils::{BrokerError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No request handled yet.
    Connected,
    /// Nothing in flight to this session.
    Idle,
    /// Holding at least one unacknowledged queue message.
    AwaitingAck,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connected => "connected",
            SessionState::Idle => "idle",
            SessionState::AwaitingAck => "awaiting-ack",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Session {
    pub id: SessionId,
    pub peer: String,
    broker: Arc<Broker>,
    handle: Mutex<Option<SessionHandle>>,
    subscriptions: Mutex<HashSet<(String, Mode)>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    /// Create a session and the receiving end of its outbound channel.
    pub fn new(broker: Arc<Broker>, peer: impl Into<String>) -> (Arc<Self>, Receiver<Outbound>) {
        let (handle, rx) = SessionHandle::channel(broker.settings().outbound_buffer);
        let session = Arc::new(Self {
            id: handle.id.clone(),
            peer: peer.into(),
            broker,
            handle: Mutex::new(Some(handle)),
            subscriptions: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        info!("Session {} connected from {}", session.id, session.peer);
        (session, rx)
    }

    /// The outbound handle, `None` once the session is closed.
    pub fn handle(&self) -> Option<SessionHandle> {
        self.handle.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<(String, Mode)> {
        let mut subs: Vec<_> = self.subscriptions.lock().iter().cloned().collect();
        subs.sort();
        subs
    }

    /// Decode one frame, run it, and queue the reply if there is one.
    pub async fn handle_frame(&self, text: &str) {
        if let Some(reply) = self.process(text).await {
            self.reply(reply).await;
        }
    }

    /// Decode and run one frame, returning the reply owed to the client.
    pub async fn process(&self, text: &str) -> Option<ServerMessage> {
        self.started.store(true, Ordering::SeqCst);
        match Request::parse(text) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                debug!("Session {} sent an invalid request: {e}", self.id);
                Some(ServerMessage::error(&e, None))
            }
        }
    }

    pub async fn handle_request(&self, request: Request) -> Option<ServerMessage> {
        let message_id = request.message_id().map(str::to_string);
        let result = match request {
            Request::Publish {
                topic,
                mode,
                payload,
            } => match self.broker.publish(&topic, mode, payload).await {
                Ok(message) => {
                    return Some(ServerMessage::Ack {
                        message_id: message.id.clone(),
                    });
                }
                Err(e) => Err(e),
            },
            Request::Subscribe {
                topic,
                mode,
                replay,
            } => self.subscribe(topic, mode, replay).await,
            Request::Unsubscribe { topic, mode } => {
                self.subscriptions.lock().remove(&(topic.clone(), mode));
                self.broker.unsubscribe(&topic, mode, &self.id).await
            }
            Request::Ack { topic, message_id } => {
                self.broker.ack(&topic, &message_id, &self.id).await
            }
            Request::Nack { topic, message_id } => {
                self.broker.nack(&topic, &message_id, &self.id).await
            }
        };

        match result {
            Ok(()) => None,
            Err(e) => {
                match e.kind() {
                    ErrorKind::UnknownMessageId => {
                        info!("Session {}: {e}", self.id);
                    }
                    ErrorKind::PersistenceFailure => {
                        warn!("Session {}: {e}", self.id);
                    }
                    _ => debug!("Session {}: {e}", self.id),
                }
                Some(ServerMessage::error(&e, message_id.as_deref()))
            }
        }
    }

    async fn subscribe(&self, topic: String, mode: Mode, replay: bool) -> Result<(), BrokerError> {
        let Some(handle) = self.handle() else {
            return Ok(());
        };
        self.broker.subscribe(&topic, mode, &handle, replay).await?;
        self.subscriptions.lock().insert((topic.clone(), mode));

        // Lost a race with `close`: its teardown may have missed this topic.
        if self.is_closed() {
            self.broker.unsubscribe(&topic, mode, &self.id).await?;
        }
        Ok(())
    }

    /// Queue a reply behind any pending deliveries. Dropped silently once the
    /// session is closed.
    pub async fn reply(&self, reply: ServerMessage) {
        let Some(handle) = self.handle() else {
            return;
        };
        if !handle.reply(reply).await {
            debug!("Session {} is gone; reply dropped", self.id);
        }
    }

    /// Tear the session down: leave every topic (requeueing in-flight queue
    /// messages) and drop the outbound sender so the writer drains and exits.
    /// Returns false if the session was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let subscriptions: Vec<(String, Mode)> = self.subscriptions.lock().drain().collect();
        self.handle.lock().take();

        let count = subscriptions.len();
        self.broker.disconnect(&self.id, subscriptions).await;
        info!(
            "Session {} ({}) closed, left {count} subscription(s)",
            self.id, self.peer
        );
        true
    }

    pub async fn state(&self) -> SessionState {
        if self.is_closed() {
            return SessionState::Closed;
        }
        if !self.started.load(Ordering::SeqCst) {
            return SessionState::Connected;
        }
        let queues: Vec<String> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, mode)| *mode == Mode::Queue)
            .map(|(topic, _)| topic.clone())
            .collect();
        if self.broker.outstanding_for(&self.id, &queues).await > 0 {
            SessionState::AwaitingAck
        } else {
            SessionState::Idle
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
