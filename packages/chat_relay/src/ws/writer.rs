//! Single-writer discipline for one connection.
//!
//! The read loop and every relay hold a [`ConnectionWriter`]; only the task
//! running [`run_writer`] touches the socket sink, so frames never interleave.

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::metrics::ServerMetrics;

use super::codec;
use super::protocol::ServerMessage;

/// The writer task has stopped; the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection writer closed")]
pub struct WriterClosed;

/// Cloneable handle onto a connection's bounded outbound queue.
#[derive(Clone, Debug)]
pub struct ConnectionWriter {
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionWriter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message, waiting for room if the queue is full.
    pub async fn send(&self, msg: ServerMessage) -> Result<(), WriterClosed> {
        self.tx.send(msg).await.map_err(|_| WriterClosed)
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain the outbound queue into the socket until every writer handle is
/// dropped or the socket fails, then close the socket.
///
/// A message that fails to encode is logged and skipped; the connection stays up.
pub(crate) async fn run_writer<S>(
    mut rx: mpsc::Receiver<ServerMessage>,
    mut sink: S,
    metrics: Arc<ServerMetrics>,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let json = match codec::encode(&msg) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            debug!("Socket send failed, stopping writer");
            break;
        }
        metrics.message_sent();
    }
    rx.close();
    let _ = sink.close().await;
}
