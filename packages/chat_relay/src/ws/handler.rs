//! WebSocket Handler
//!
//! Drives one registered connection from its first `ready` frame to teardown.

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;

use super::codec;
use super::dispatch::{ConnectionContext, dispatch_client_message};
use super::protocol::ServerMessage;
use super::registry::{ConnectionHandle, SessionGuard, SessionRegistry};
use super::writer::{ConnectionWriter, WriterClosed, run_writer};

/// How long teardown waits for queued frames to flush.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Serving,
    Closing,
    Closed,
}

struct Lifecycle<'a> {
    session_id: &'a str,
    state: ConnectionState,
}

impl Lifecycle<'_> {
    fn transition(&mut self, next: ConnectionState) {
        debug!(session_id = %self.session_id, "Connection {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Serve an upgraded WebSocket for a session registered during the upgrade.
pub async fn handle_connection(
    socket: WebSocket,
    session: SessionGuard,
    registry: Arc<SessionRegistry>,
    config: Arc<ServerConfig>,
    metrics: Arc<ServerMetrics>,
) {
    let (sender, receiver) = socket.split();
    run_connection(receiver, sender, session, registry, config, metrics).await;
}

/// Transport-agnostic body of [`handle_connection`].
pub(crate) async fn run_connection<R, W, E>(
    receiver: R,
    sender: W,
    session: SessionGuard,
    registry: Arc<SessionRegistry>,
    config: Arc<ServerConfig>,
    metrics: Arc<ServerMetrics>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    W: Sink<Message> + Unpin + Send + 'static,
    E: Display,
{
    let session_id = session.session_id().to_string();
    let mut lifecycle = Lifecycle {
        session_id: &session_id,
        state: ConnectionState::Connecting,
    };
    info!(session_id = %session_id, "New WebSocket connection");
    metrics.connection_opened();

    let (writer, rx) = ConnectionWriter::channel(config.websocket.send_queue_capacity);
    let mut writer_task = tokio::spawn(run_writer(rx, sender, metrics.clone()));

    let cancel = CancellationToken::new();
    registry
        .add(
            &session_id,
            ConnectionHandle {
                writer: writer.clone(),
                cancel: cancel.clone(),
            },
        )
        .await;

    let ctx = ConnectionContext::new(
        session_id.clone(),
        registry.directory().clone(),
        writer,
        cancel.clone(),
        metrics.clone(),
    );

    lifecycle.transition(ConnectionState::Ready);
    let ready = ServerMessage::Ready {
        session_id: session_id.clone(),
    };
    if ctx.writer.send(ready).await.is_ok() {
        lifecycle.transition(ConnectionState::Serving);
        serve(&ctx, receiver, &cancel).await;
    } else {
        warn!(session_id = %session_id, "Failed to send ready frame");
    }

    lifecycle.transition(ConnectionState::Closing);
    let stopped = ctx.relays.stop_all().await;
    if stopped > 0 {
        debug!(session_id = %session_id, "Stopped {} relays", stopped);
    }
    drop(ctx);
    cancel.cancel();
    registry.remove(&session_id).await;

    // Every writer handle is gone now, so the writer drains and closes the socket.
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        warn!(session_id = %session_id, "Writer did not flush in time, aborting");
        writer_task.abort();
    }

    session.release().await;
    metrics.connection_closed();
    lifecycle.transition(ConnectionState::Closed);
    info!(session_id = %session_id, "WebSocket connection closed");
}

async fn serve<R, E>(ctx: &ConnectionContext, mut receiver: R, cancel: &CancellationToken)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(session_id = %ctx.session_id, "Connection cancelled");
                break;
            }
            frame = receiver.next() => frame,
        };

        let result = match frame {
            Some(Ok(Message::Text(text))) => handle_frame(ctx, text.as_str().as_bytes()).await,
            Some(Ok(Message::Binary(bytes))) => handle_frame(ctx, &bytes).await,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(()),
            Some(Ok(Message::Close(_))) | None => {
                debug!(session_id = %ctx.session_id, "Client closed connection");
                break;
            }
            Some(Err(e)) => {
                ctx.metrics.websocket_error();
                debug!(session_id = %ctx.session_id, "WebSocket error: {}", e);
                break;
            }
        };

        if result.is_err() {
            debug!(session_id = %ctx.session_id, "Writer closed, ending connection");
            break;
        }
    }
}

/// Decode, dispatch and answer one frame.
///
/// Only a closed writer is an error here; bad requests are answered with an
/// error envelope echoing the frame.
async fn handle_frame(ctx: &ConnectionContext, bytes: &[u8]) -> Result<(), WriterClosed> {
    ctx.metrics.message_received();

    let msg = match codec::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            ctx.metrics.decode_error();
            debug!(session_id = %ctx.session_id, "Rejected frame: {}", e);
            return ctx
                .writer
                .send(ServerMessage::error(
                    &ctx.session_id,
                    e.code(),
                    &e,
                    codec::echo(bytes),
                ))
                .await;
        }
    };

    info!(session_id = %ctx.session_id, kind = msg.kind(), "Received message");

    match dispatch_client_message(ctx, msg).await {
        Ok(Some(reply)) => ctx.writer.send(reply).await,
        Ok(None) => Ok(()),
        Err(e) => {
            ctx.metrics.dispatch_error();
            debug!(session_id = %ctx.session_id, code = e.code().as_u16(), "Request failed: {}", e);
            ctx.writer
                .send(ServerMessage::error(
                    &ctx.session_id,
                    e.code(),
                    &e,
                    codec::echo(bytes),
                ))
                .await
        }
    }
}
