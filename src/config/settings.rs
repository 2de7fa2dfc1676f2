use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub log: LogSettings,
}

/// Configuration settings for the listeners.
///
/// `ws_port` enables the WebSocket listener alongside the line-delimited TCP one.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub ws_port: Option<u16>,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
}

/// Configuration settings for the routing and delivery engine.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Maximum backlog length of a queue topic before publishes get `QueueFull`.
    pub queue_capacity: usize,
    pub ack_timeout_ms: u64,
    /// Unacknowledged messages a single consumer may hold per queue topic.
    pub consumer_prefetch: usize,
    /// Capacity of every session's outbound channel.
    pub outbound_buffer: usize,
    /// Recent pub/sub messages retained per topic for opt-in replay.
    pub replay_window: usize,
    pub max_payload_bytes: usize,
    pub sweep_interval_ms: u64,
    /// Zero disables the periodic status log.
    pub status_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sled,
    Memory,
}

/// Configuration settings for the durable queue store.
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub backend: StoreBackend,
    pub path: String,
    /// Flush to disk on every persist/remove before reporting success.
    pub sync_writes: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
    pub max_connections: Option<usize>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub queue_capacity: Option<usize>,
    pub ack_timeout_ms: Option<u64>,
    pub consumer_prefetch: Option<usize>,
    pub outbound_buffer: Option<usize>,
    pub replay_window: Option<usize>,
    pub max_payload_bytes: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
    pub status_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialPersistenceSettings {
    pub backend: Option<StoreBackend>,
    pub path: Option<String>,
    pub sync_writes: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge_onto(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let persistence = self.persistence.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                ws_port: server.ws_port.or(default.server.ws_port),
                max_connections: server
                    .max_connections
                    .unwrap_or(default.server.max_connections),
                max_frame_bytes: server
                    .max_frame_bytes
                    .unwrap_or(default.server.max_frame_bytes),
            },
            broker: BrokerSettings {
                queue_capacity: broker
                    .queue_capacity
                    .unwrap_or(default.broker.queue_capacity),
                ack_timeout_ms: broker
                    .ack_timeout_ms
                    .unwrap_or(default.broker.ack_timeout_ms),
                consumer_prefetch: broker
                    .consumer_prefetch
                    .unwrap_or(default.broker.consumer_prefetch),
                outbound_buffer: broker
                    .outbound_buffer
                    .unwrap_or(default.broker.outbound_buffer),
                replay_window: broker
                    .replay_window
                    .unwrap_or(default.broker.replay_window),
                max_payload_bytes: broker
                    .max_payload_bytes
                    .unwrap_or(default.broker.max_payload_bytes),
                sweep_interval_ms: broker
                    .sweep_interval_ms
                    .unwrap_or(default.broker.sweep_interval_ms),
                status_interval_secs: broker
                    .status_interval_secs
                    .unwrap_or(default.broker.status_interval_secs),
            },
            persistence: PersistenceSettings {
                backend: persistence
                    .backend
                    .unwrap_or(default.persistence.backend),
                path: persistence.path.unwrap_or(default.persistence.path),
                sync_writes: persistence
                    .sync_writes
                    .unwrap_or(default.persistence.sync_writes),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8888,
                ws_port: None,
                max_connections: 1000,
                max_frame_bytes: 1024 * 1024,
            },
            broker: BrokerSettings::default(),
            persistence: PersistenceSettings {
                backend: StoreBackend::Sled,
                path: ".msg_data".to_string(),
                sync_writes: true,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            ack_timeout_ms: 30_000,
            consumer_prefetch: 1,
            outbound_buffer: 1024,
            replay_window: 0,
            max_payload_bytes: 256 * 1024,
            sweep_interval_ms: 500,
            status_interval_secs: 60,
        }
    }
}
