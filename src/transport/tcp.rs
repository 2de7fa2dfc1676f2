//! TCP transport
//!
//! One JSON request per line in, one JSON response or delivery per line out.
//! Each connection gets a reader loop (this task) and a writer task that
//! drains the session's outbound channel into the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::transport::message::ServerMessage;
use crate::transport::{ServerContext, encode};
use crate::utils::BrokerError;

pub async fn start_tcp_server(addr: &str, ctx: ServerContext) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("TCP server listening on {}", listener.local_addr()?);
    serve_tcp(listener, ctx).await;
    Ok(())
}

/// Accept connections on `listener` until the shutdown token fires.
pub async fn serve_tcp(listener: TcpListener, ctx: ServerContext) {
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
                    warn!("TCP accept failed: {e}");
                    continue;
                }
            },
        };

        tokio::spawn(handle_connection(stream, peer, ctx.clone(), permit));
    }
    info!("TCP listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    _permit: OwnedSemaphorePermit,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(ctx.max_frame_bytes),
    );
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let (session, mut outbound) = Session::new(Arc::clone(&ctx.broker), peer.to_string());
    let token = ctx.shutdown.child_token();

    let writer_task = {
        let token = token.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound.recv().await {
                let frame = match encode(&ServerMessage::from(item)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode frame for {session_id}: {e}");
                        continue;
                    }
                };
                if let Err(e) = writer.send(frame).await {
                    debug!("Write to {session_id} failed: {e}");
                    break;
                }
            }
            token.cancel();
        })
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    session.handle_frame(&line).await;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let err = BrokerError::InvalidPayload(format!(
                        "frame exceeds {} bytes",
                        ctx.max_frame_bytes
                    ));
                    session.reply(ServerMessage::error(&err, None)).await;
                    warn!("Closing {}: oversized frame from {peer}", session.id);
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!("Read from {} failed: {e}", session.id);
                    break;
                }
                None => break,
            },
        }
    }

    session.close().await;
    if let Err(e) = writer_task.await {
        warn!("Writer task for {} ended abnormally: {e}", session.id);
    }
}
