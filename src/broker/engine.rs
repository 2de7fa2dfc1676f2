//! Broker engine
//!
//! `Broker` ties the registry, the two dispatchers and the store together and
//! is shared by every session as `Arc<Broker>`. It is responsible for:
//! - validating publishes and routing them by mode
//! - subscription and consumer membership changes
//! - acknowledgments, negative acknowledgments and session teardown
//! - reloading durable queue state at startup
//! - the background ack-timeout sweeper and status reporter
//!
//! There is no broker-wide lock. Each call touches the state of exactly the
//! topic it names.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::message::{Message, Mode};
use crate::broker::pubsub::PubSubDispatcher;
use crate::broker::queue::QueueDispatcher;
use crate::broker::registry::Registry;
use crate::broker::topic::{TopicKey, TopicSnapshot, validate_topic_name};
use crate::config::BrokerSettings;
use crate::persistence::MessageStore;
use crate::session::{SessionHandle, SessionId};
use crate::utils::BrokerError;
use crate::utils::error::Result;

#[derive(Debug)]
pub struct Broker {
    registry: Registry,
    pubsub: PubSubDispatcher,
    queues: QueueDispatcher,
    store: Arc<dyn MessageStore>,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(settings: BrokerSettings, store: Arc<dyn MessageStore>) -> Self {
        Self {
            registry: Registry::new(settings.queue_capacity, settings.replay_window),
            pubsub: PubSubDispatcher::new(),
            queues: QueueDispatcher::new(
                Arc::clone(&store),
                Duration::from_millis(settings.ack_timeout_ms),
                settings.consumer_prefetch,
            ),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reload every durable queue into its backlog. Must run before any
    /// session attaches. Returns the number of restored messages.
    pub async fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for name in self.store.topics().await? {
            let messages = self.store.load_all(&name).await?;
            let count = match self.queues.restore(&self.registry, &name, messages).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Skipping stored queue '{name}': {e}");
                    continue;
                }
            };
            info!("Recovered {count} message(s) for queue '{name}'");
            restored += count;
        }
        Ok(restored)
    }

    /// Publish `payload` to `(topic, mode)` and return the broker-assigned message.
    ///
    /// A pub/sub publish to a topic nobody subscribes to is discarded without
    /// creating the topic, unless a replay window has to retain it.
    pub async fn publish(&self, topic: &str, mode: Mode, payload: Value) -> Result<Arc<Message>> {
        validate_topic_name(topic)?;
        self.validate_payload(&payload)?;
        let message = Message::new(topic, mode, payload);

        match mode {
            Mode::PubSub => {
                let message = Arc::new(message);
                self.fan_out(topic, &message)?;
                Ok(message)
            }
            Mode::Queue => {
                let message = self.queues.publish(&self.registry, topic, message).await?;
                debug!("Queued {} on '{topic}'", message.id);
                Ok(message)
            }
        }
    }

    fn fan_out(&self, name: &str, message: &Arc<Message>) -> Result<()> {
        loop {
            let topic = if self.settings.replay_window == 0 {
                match self.registry.pubsub_topic(name) {
                    Some(topic) => topic,
                    None => {
                        debug!("No subscribers on '{name}'; discarded {}", message.id);
                        return Ok(());
                    }
                }
            } else {
                self.registry.ensure_pubsub(name)?
            };

            let Some(fan_out) = self.pubsub.publish(&topic, Arc::clone(message)) else {
                continue;
            };
            debug!(
                "Published {} to '{name}': delivered {}, dropped {}",
                message.id, fan_out.delivered, fan_out.dropped
            );
            if fan_out.pruned > 0 {
                self.registry.retire_pubsub(&topic);
            }
            return Ok(());
        }
    }

    /// Subscribe (pub/sub) or start consuming (queue). Idempotent.
    ///
    /// `replay` only applies to pub/sub and only has an effect when a replay
    /// window is configured.
    pub async fn subscribe(
        &self,
        topic: &str,
        mode: Mode,
        session: &SessionHandle,
        replay: bool,
    ) -> Result<()> {
        match mode {
            Mode::PubSub => loop {
                let topic = self.registry.ensure_pubsub(topic)?;
                let attached = if replay {
                    self.pubsub
                        .subscribe_with_replay(&topic, session.clone())
                        .map(|replayed| {
                            debug!(
                                "Replayed {replayed} message(s) on '{}' to {}",
                                topic.name, session.id
                            )
                        })
                } else {
                    self.registry
                        .attach_subscriber(&topic, session.clone())
                        .map(|_| ())
                };
                if attached.is_some() {
                    break;
                }
            },
            Mode::Queue => {
                self.queues
                    .attach_consumer(&self.registry, topic, session.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Leave a topic. Unknown topics and non-members are a no-op; leaving a
    /// queue requeues whatever the session still held there.
    pub async fn unsubscribe(&self, topic: &str, mode: Mode, session: &SessionId) -> Result<()> {
        validate_topic_name(topic)?;
        match mode {
            Mode::PubSub => {
                self.registry.detach_subscriber(topic, session);
            }
            Mode::Queue => {
                if let Some(topic) = self.registry.queue_topic(topic) {
                    self.queues
                        .detach_consumer(&self.registry, &topic, session)
                        .await;
                }
            }
        }
        Ok(())
    }

    pub async fn ack(&self, topic: &str, message_id: &str, session: &SessionId) -> Result<()> {
        let queue = self
            .registry
            .queue_topic(topic)
            .ok_or_else(|| BrokerError::UnknownMessageId(message_id.to_string()))?;
        self.queues.ack(&queue, message_id, session).await
    }

    pub async fn nack(&self, topic: &str, message_id: &str, session: &SessionId) -> Result<()> {
        let queue = self
            .registry
            .queue_topic(topic)
            .ok_or_else(|| BrokerError::UnknownMessageId(message_id.to_string()))?;
        self.queues.nack(&queue, message_id, session).await
    }

    /// Remove `session` from every listed topic, requeueing its in-flight
    /// queue messages. Topics are detached concurrently.
    pub async fn disconnect<I>(&self, session: &SessionId, subscriptions: I)
    where
        I: IntoIterator<Item = (String, Mode)>,
    {
        let detaches = subscriptions.into_iter().map(|(topic, mode)| async move {
            if let Err(e) = self.unsubscribe(&topic, mode, session).await {
                warn!("Failed to detach {session} from '{topic}' ({mode}): {e}");
            }
        });
        join_all(detaches).await;
    }

    /// Messages currently in flight to `session` across `queues`.
    pub async fn outstanding_for(&self, session: &str, queues: &[String]) -> usize {
        let mut total = 0;
        for name in queues {
            if let Some(topic) = self.registry.queue_topic(name) {
                total += self.queues.outstanding_for(&topic, session).await;
            }
        }
        total
    }

    /// One sweep over all queues: requeue overdue messages and run a dispatch
    /// cycle. Returns the number of expired deliveries.
    pub async fn expire_overdue(&self) -> usize {
        let mut expired = 0;
        for topic in self.registry.queue_topics() {
            expired += self.queues.expire_overdue(&self.registry, &topic).await;
        }
        expired
    }

    pub async fn snapshot(&self, topic: &str, mode: Mode) -> Option<TopicSnapshot> {
        self.registry.snapshot(topic, mode).await
    }

    /// Snapshots of every topic, for status reporting.
    pub async fn status(&self) -> Vec<(TopicKey, TopicSnapshot)> {
        let mut status = Vec::new();
        for key in self.registry.topics() {
            if let Some(snapshot) = self.registry.snapshot(&key.name, key.mode).await {
                status.push((key, snapshot));
            }
        }
        status
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await?;
        Ok(())
    }

    /// Background task: periodically expire overdue deliveries until
    /// `shutdown` fires.
    pub async fn run_ack_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let period = Duration::from_millis(self.settings.sweep_interval_ms.max(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.expire_overdue().await;
                }
            }
        }
        debug!("Ack sweeper stopped");
    }

    /// Background task: log every topic's counters each
    /// `status_interval_secs`. Disabled when the interval is zero.
    pub async fn run_status_reporter(self: Arc<Self>, shutdown: CancellationToken) {
        if self.settings.status_interval_secs == 0 {
            return;
        }
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.status_interval_secs));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for (key, s) in self.status().await {
                        info!(
                            topic = %key.name,
                            mode = %key.mode,
                            backlog = s.backlog_depth,
                            in_flight = s.in_flight_depth,
                            subscribers = s.subscriber_count,
                            consumers = s.consumer_count,
                            delivery_failures = s.delivery_failures,
                            "Topic status"
                        );
                    }
                }
            }
        }
    }

    fn validate_payload(&self, payload: &Value) -> Result<()> {
        if payload.is_null() {
            return Err(BrokerError::InvalidPayload("payload is null".to_string()));
        }
        let size = serde_json::to_vec(payload)
            .map_err(|e| BrokerError::InvalidPayload(e.to_string()))?
            .len();
        if size > self.settings.max_payload_bytes {
            return Err(BrokerError::InvalidPayload(format!(
                "payload is {size} bytes, limit is {}",
                self.settings.max_payload_bytes
            )));
        }
        Ok(())
    }
}
