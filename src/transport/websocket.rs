//! WebSocket transport
//!
//! Serves the same JSON protocol as the TCP listener, one request or response
//! per text frame. Responsibilities:
//! - Accept TCP connections and complete the WebSocket handshake
//! - Create a `Session` per connection and feed it every text frame
//! - Forward the session's outbound channel to the socket
//! - Tear the session down once either direction ends

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::OwnedSemaphorePermit;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::session::Session;
use crate::transport::message::ServerMessage;
use crate::transport::{ServerContext, encode};
use crate::utils::BrokerError;

pub async fn start_websocket_server(addr: &str, ctx: ServerContext) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve_websocket(listener, ctx).await;
    Ok(())
}

pub async fn serve_websocket(listener: TcpListener, ctx: ServerContext) {
    loop {
        let permit = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            permit = Arc::clone(&ctx.connections).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("WebSocket accept failed: {e}");
                    continue;
                }
            },
        };

        spawn(handle_connection(stream, peer, ctx.clone(), permit));
    }
    info!("WebSocket listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    _permit: OwnedSemaphorePermit,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error from {peer}: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (session, mut outbound) = Session::new(Arc::clone(&ctx.broker), format!("ws://{peer}"));
    let token = ctx.shutdown.child_token();

    let send_loop = {
        let token = token.clone();
        let session_id = session.id.clone();
        spawn(async move {
            while let Some(item) = outbound.recv().await {
                let text = match encode(&ServerMessage::from(item)) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode frame for {session_id}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                    debug!("Failed to send message to {session_id}: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            token.cancel();
            debug!("Send loop closed for {session_id}");
        })
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if text.len() > ctx.max_frame_bytes {
                        let err = BrokerError::InvalidPayload(format!(
                            "frame exceeds {} bytes",
                            ctx.max_frame_bytes
                        ));
                        session.reply(ServerMessage::error(&err, None)).await;
                        warn!("Closing {}: oversized frame from {peer}", session.id);
                        break;
                    }
                    session.handle_frame(text.as_str()).await;
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    let err = BrokerError::InvalidPayload("binary frames are not supported".to_string());
                    session.reply(ServerMessage::error(&err, None)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read from {} failed: {e}", session.id);
                    break;
                }
            },
        }
    }

    session.close().await;
    if let Err(e) = send_loop.await {
        warn!("Send loop for {} ended abnormally: {e}", session.id);
    }
}
