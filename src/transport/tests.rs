use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::broker::message::Mode;
use crate::broker::topic::TopicSnapshot;
use crate::config::BrokerSettings;
use crate::persistence::MemoryStore;
use crate::transport::ServerContext;
use crate::transport::message::{Request, ServerMessage};
use crate::transport::tcp::serve_tcp;
use crate::transport::websocket::serve_websocket;
use crate::utils::ErrorKind;

const MAX_FRAME: usize = 1024;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

fn parse_err(text: &str) -> ErrorKind {
    Request::parse(text).unwrap_err().kind()
}

#[test]
fn test_parse_publish_defaults_to_pubsub() {
    let request = Request::parse(r#"{"action":"publish","topic":"t","payload":{"a":1}}"#).unwrap();
    assert_eq!(
        request,
        Request::Publish {
            topic: "t".to_string(),
            mode: Mode::PubSub,
            payload: json!({"a": 1}),
        }
    );
}

#[test]
fn test_parse_subscribe_with_replay() {
    let request =
        Request::parse(r#"{"action":"subscribe","topic":"t","mode":"queue","replay":true}"#)
            .unwrap();
    assert_eq!(
        request,
        Request::Subscribe {
            topic: "t".to_string(),
            mode: Mode::Queue,
            replay: true,
        }
    );
}

#[test]
fn test_parse_ack_defaults_to_queue() {
    let request = Request::parse(r#"{"action":"ack","topic":"q","message_id":"m1"}"#).unwrap();
    assert_eq!(request.message_id(), Some("m1"));
    assert!(matches!(request, Request::Ack { .. }));

    let request = Request::parse(r#"{"action":"nack","topic":"q","message_id":"m1"}"#).unwrap();
    assert!(matches!(request, Request::Nack { .. }));
}

#[test]
fn test_parse_errors() {
    assert_eq!(parse_err("{"), ErrorKind::InvalidPayload);
    assert_eq!(parse_err(r#"{"topic":"t"}"#), ErrorKind::InvalidPayload);
    assert_eq!(parse_err(r#"{"action":"publish"}"#), ErrorKind::InvalidTopic);
    assert_eq!(
        parse_err(r#"{"action":"publish","topic":"t"}"#),
        ErrorKind::InvalidPayload
    );
    assert_eq!(
        parse_err(r#"{"action":"explode","topic":"t"}"#),
        ErrorKind::InvalidPayload
    );
    assert_eq!(
        parse_err(r#"{"action":"subscribe","topic":"t","mode":"fanout"}"#),
        ErrorKind::InvalidMode
    );
    assert_eq!(
        parse_err(r#"{"action":"ack","topic":"t","mode":"pubsub","message_id":"m"}"#),
        ErrorKind::InvalidMode
    );
    assert_eq!(
        parse_err(r#"{"action":"ack","topic":"t","message_id":""}"#),
        ErrorKind::InvalidPayload
    );
}

#[test]
fn test_server_message_wire_shape() {
    let ack = serde_json::to_value(ServerMessage::Ack {
        message_id: "m1".to_string(),
    })
    .unwrap();
    assert_eq!(ack, json!({"type": "ack", "message_id": "m1"}));

    let err = serde_json::to_value(ServerMessage::Error {
        error: ErrorKind::QueueFull,
        message_id: None,
        detail: None,
    })
    .unwrap();
    assert_eq!(err, json!({"type": "error", "error": "QueueFull"}));

    let delivery = serde_json::to_value(ServerMessage::Message {
        topic: "q".to_string(),
        message_id: "m2".to_string(),
        payload: json!([1, 2]),
        mode: Mode::Queue,
    })
    .unwrap();
    assert_eq!(delivery["type"], "message");
    assert_eq!(delivery["mode"], "queue");
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

fn test_broker(settings: BrokerSettings) -> Arc<Broker> {
    Arc::new(Broker::new(settings, Arc::new(MemoryStore::new())))
}

fn context(broker: &Arc<Broker>, shutdown: &CancellationToken) -> ServerContext {
    ServerContext::new(Arc::clone(broker), 16, MAX_FRAME, shutdown.clone())
}

async fn start_tcp(settings: BrokerSettings) -> (SocketAddr, Arc<Broker>, CancellationToken) {
    let broker = test_broker(settings);
    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_tcp(listener, context(&broker, &shutdown)));
    (addr, broker, shutdown)
}

/// Poll a topic until `check` holds.
async fn wait_for<F, Fut>(read: F, check: impl Fn(&TopicSnapshot) -> bool)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<TopicSnapshot>>,
{
    for _ in 0..200 {
        if read().await.as_ref().is_some_and(&check) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("topic never reached the expected state");
}

struct LineClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, request: Value) {
        self.send_raw(&request.to_string()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }
}

#[tokio::test]
async fn test_tcp_pubsub_roundtrip() {
    let (addr, broker, shutdown) = start_tcp(BrokerSettings::default()).await;
    let mut subscriber = LineClient::connect(addr).await;
    let mut publisher = LineClient::connect(addr).await;

    subscriber
        .send(json!({"action": "subscribe", "topic": "news"}))
        .await;
    wait_for(
        || broker.snapshot("news", Mode::PubSub),
        |s| s.subscriber_count == 1,
    )
    .await;

    publisher
        .send(json!({"action": "publish", "topic": "news", "payload": {"headline": "hi"}}))
        .await;
    let published_id = match publisher.recv().await {
        Some(ServerMessage::Ack { message_id }) => message_id,
        other => panic!("expected ack, got {other:?}"),
    };

    match subscriber.recv().await {
        Some(ServerMessage::Message {
            topic,
            message_id,
            payload,
            mode,
        }) => {
            assert_eq!(topic, "news");
            assert_eq!(message_id, published_id);
            assert_eq!(payload, json!({"headline": "hi"}));
            assert_eq!(mode, Mode::PubSub);
        }
        other => panic!("expected delivery, got {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_tcp_queue_requeue_on_disconnect() {
    let (addr, broker, shutdown) = start_tcp(BrokerSettings::default()).await;
    let mut first = LineClient::connect(addr).await;
    first
        .send(json!({"action": "subscribe", "topic": "jobs", "mode": "queue"}))
        .await;
    wait_for(
        || broker.snapshot("jobs", Mode::Queue),
        |s| s.consumer_count == 1,
    )
    .await;

    let mut publisher = LineClient::connect(addr).await;
    publisher
        .send(json!({"action": "publish", "topic": "jobs", "mode": "queue", "payload": 42}))
        .await;
    assert!(matches!(publisher.recv().await, Some(ServerMessage::Ack { .. })));

    let held = match first.recv().await {
        Some(ServerMessage::Message { message_id, .. }) => message_id,
        other => panic!("expected delivery, got {other:?}"),
    };
    drop(first);
    wait_for(
        || broker.snapshot("jobs", Mode::Queue),
        |s| s.consumer_count == 0 && s.backlog_depth == 1,
    )
    .await;

    let mut second = LineClient::connect(addr).await;
    second
        .send(json!({"action": "subscribe", "topic": "jobs", "mode": "queue"}))
        .await;
    match second.recv().await {
        Some(ServerMessage::Message { message_id, .. }) => assert_eq!(message_id, held),
        other => panic!("expected redelivery, got {other:?}"),
    }

    second
        .send(json!({"action": "ack", "topic": "jobs", "message_id": held}))
        .await;
    wait_for(
        || broker.snapshot("jobs", Mode::Queue),
        |s| s.in_flight_depth == 0 && s.backlog_depth == 0,
    )
    .await;

    // Second ack is answered, not fatal.
    second
        .send(json!({"action": "ack", "topic": "jobs", "message_id": held}))
        .await;
    match second.recv().await {
        Some(ServerMessage::Error { error, .. }) => {
            assert_eq!(error, ErrorKind::UnknownMessageId)
        }
        other => panic!("expected error, got {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_tcp_queue_full_is_reported() {
    let (addr, _broker, shutdown) = start_tcp(BrokerSettings {
        queue_capacity: 1,
        ..BrokerSettings::default()
    })
    .await;
    let mut publisher = LineClient::connect(addr).await;
    let publish = json!({"action": "publish", "topic": "jobs", "mode": "queue", "payload": 1});

    publisher.send(publish.clone()).await;
    assert!(matches!(publisher.recv().await, Some(ServerMessage::Ack { .. })));

    publisher.send(publish).await;
    match publisher.recv().await {
        Some(ServerMessage::Error { error, detail, .. }) => {
            assert_eq!(error, ErrorKind::QueueFull);
            assert!(detail.is_some());
        }
        other => panic!("expected QueueFull, got {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_tcp_bad_request_keeps_connection() {
    let (addr, _broker, shutdown) = start_tcp(BrokerSettings::default()).await;
    let mut client = LineClient::connect(addr).await;

    client.send_raw("this is not json").await;
    assert!(matches!(
        client.recv().await,
        Some(ServerMessage::Error {
            error: ErrorKind::InvalidPayload,
            ..
        })
    ));

    client
        .send(json!({"action": "publish", "topic": "t", "payload": true}))
        .await;
    assert!(matches!(client.recv().await, Some(ServerMessage::Ack { .. })));
    shutdown.cancel();
}

#[tokio::test]
async fn test_tcp_oversized_frame_closes_connection() {
    let (addr, _broker, shutdown) = start_tcp(BrokerSettings::default()).await;
    let mut client = LineClient::connect(addr).await;

    client.send_raw(&"x".repeat(MAX_FRAME * 2)).await;
    assert!(matches!(
        client.recv().await,
        Some(ServerMessage::Error {
            error: ErrorKind::InvalidPayload,
            ..
        })
    ));
    assert!(client.recv().await.is_none());
    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_websocket_roundtrip() {
    let broker = test_broker(BrokerSettings::default());
    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_websocket(listener, context(&broker, &shutdown)));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut ws_stream, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .expect("WebSocket handshake failed");

    let subscribe = json!({"action": "subscribe", "topic": "jobs", "mode": "queue"});
    ws_stream
        .send(WsMessage::Text(subscribe.to_string().into()))
        .await
        .unwrap();
    wait_for(
        || broker.snapshot("jobs", Mode::Queue),
        |s| s.consumer_count == 1,
    )
    .await;

    let published = broker
        .publish("jobs", Mode::Queue, json!("over websocket"))
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), ws_stream.next())
        .await
        .unwrap()
        .expect("Did not receive response")
        .unwrap();
    let server_msg: ServerMessage = serde_json::from_slice(&response.into_data()).unwrap();
    match server_msg {
        ServerMessage::Message {
            message_id, mode, ..
        } => {
            assert_eq!(message_id, published.id);
            assert_eq!(mode, Mode::Queue);
        }
        other => panic!("expected delivery, got {other:?}"),
    }

    let ack = json!({"action": "ack", "topic": "jobs", "message_id": published.id});
    ws_stream
        .send(WsMessage::Text(ack.to_string().into()))
        .await
        .unwrap();
    wait_for(
        || broker.snapshot("jobs", Mode::Queue),
        |s| s.in_flight_depth == 0,
    )
    .await;

    ws_stream.close(None).await.unwrap();
    wait_for(
        || async { Some(broker.snapshot("jobs", Mode::Queue).await.unwrap_or_default()) },
        |s| s.consumer_count == 0,
    )
    .await;
    // Drained and without consumers, the queue is retired.
    assert!(broker.registry().topics().is_empty());
    shutdown.cancel();
}
