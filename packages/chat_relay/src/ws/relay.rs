//! Channel Relay
//!
//! One task per joined channel per connection. Each relay forwards payloads
//! published on its channel topic to the connection's writer, resolving the
//! sender and recipient uuids into user summaries on the way.

use chat_directory::{Directory, Subscription, UserSummary};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::ServerMetrics;

use super::protocol::{ChannelMessagePayload, ServerMessage};
use super::writer::ConnectionWriter;

struct RelayHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The relays owned by one connection, keyed by channel id.
///
/// Every relay token is a child of the connection's token, so cancelling the
/// connection stops all of them.
pub struct RelaySet {
    session_id: String,
    parent: CancellationToken,
    relays: Mutex<HashMap<String, RelayHandle>>,
}

impl RelaySet {
    pub fn new(session_id: impl Into<String>, parent: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            parent,
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a relay for `channel_id` is still running.
    pub async fn contains(&self, channel_id: &str) -> bool {
        self.relays
            .lock()
            .await
            .get(channel_id)
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Start relaying `subscription` to `writer`.
    ///
    /// Returns `false` (and closes the subscription) if a relay for the channel
    /// is already running or the connection is shutting down.
    pub async fn start(
        &self,
        subscription: Subscription,
        writer: ConnectionWriter,
        directory: Arc<dyn Directory>,
        metrics: Arc<ServerMetrics>,
    ) -> bool {
        let channel_id = subscription.channel_id().to_string();
        let mut relays = self.relays.lock().await;

        if self.parent.is_cancelled() {
            subscription.close();
            return false;
        }
        if relays
            .get(&channel_id)
            .is_some_and(|r| !r.task.is_finished())
        {
            debug!(session_id = %self.session_id, channel = %channel_id, "Relay already running");
            subscription.close();
            return false;
        }

        metrics.relay_started();
        let cancel = self.parent.child_token();
        let task = tokio::spawn(run_relay(
            self.session_id.clone(),
            subscription,
            writer,
            directory,
            metrics,
            cancel.clone(),
        ));
        relays.insert(channel_id, RelayHandle { cancel, task });
        true
    }

    /// Stop the relay for one channel and wait for it to finish.
    /// Returns `false` if there was none.
    pub async fn stop(&self, channel_id: &str) -> bool {
        let handle = self.relays.lock().await.remove(channel_id);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    warn!(session_id = %self.session_id, channel = %channel_id, "Relay task failed: {}", e);
                }
                true
            }
            None => false,
        }
    }

    /// Stop every relay and wait for them. No relay can be started afterwards.
    pub async fn stop_all(&self) -> usize {
        self.parent.cancel();
        let drained: Vec<(String, RelayHandle)> = self.relays.lock().await.drain().collect();
        let count = drained.len();
        for (channel_id, handle) in drained {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(session_id = %self.session_id, channel = %channel_id, "Relay task failed: {}", e);
            }
        }
        count
    }

    #[cfg(test)]
    pub async fn active_channels(&self) -> Vec<String> {
        let relays = self.relays.lock().await;
        let mut channels: Vec<String> = relays
            .iter()
            .filter(|(_, r)| !r.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        channels.sort();
        channels
    }
}

async fn run_relay(
    session_id: String,
    mut subscription: Subscription,
    writer: ConnectionWriter,
    directory: Arc<dyn Directory>,
    metrics: Arc<ServerMetrics>,
    cancel: CancellationToken,
) {
    let channel_id = subscription.channel_id().to_string();
    debug!(session_id = %session_id, channel = %channel_id, "Relay started");

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = subscription.recv() => match payload {
                Some(p) => p,
                None => break,
            },
        };

        let mut message: ChannelMessagePayload = match serde_json::from_str(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id = %session_id, channel = %channel_id, "Skipping undecodable channel payload: {}", e);
                continue;
            }
        };
        if message.channel_id.is_empty() {
            message.channel_id = channel_id.clone();
        }
        message.sender = resolve_user(directory.as_ref(), message.sender_uuid.as_deref()).await;
        message.recipient =
            resolve_user(directory.as_ref(), message.recipient_uuid.as_deref()).await;

        if writer
            .send(ServerMessage::ChannelMessage(message))
            .await
            .is_err()
        {
            debug!(session_id = %session_id, channel = %channel_id, "Writer closed, stopping relay");
            break;
        }
    }

    let lagged = subscription.lagged();
    if lagged > 0 {
        metrics.messages_dropped(lagged);
    }
    subscription.close();
    metrics.relay_stopped();
    debug!(session_id = %session_id, channel = %channel_id, "Relay stopped");
}

async fn resolve_user(directory: &dyn Directory, uuid: Option<&str>) -> Option<UserSummary> {
    let uuid = uuid?;
    match directory.user_get(uuid).await {
        Ok(user) => Some(user.summary()),
        Err(e) => {
            debug!("Could not resolve user {}: {}", uuid, e);
            None
        }
    }
}
