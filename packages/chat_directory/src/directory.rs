//! The directory capability consumed by the relay.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::DirectoryError;
use crate::user::{User, UserSummary};

/// Presence, user, membership and pub/sub store shared by every connection.
///
/// Implementations are expected to make each call atomic on its own; callers
/// never hold locks across calls and must tolerate races between them.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Add a session id to the presence set. Fails with
    /// [`DirectoryError::AlreadyExists`] if it is already present.
    async fn add_connection(&self, session_id: &str) -> Result<(), DirectoryError>;

    /// Remove a session id from the presence set, together with its signed-in
    /// identity and every channel membership it holds. Removing an unknown id
    /// is not an error.
    async fn del_connection(&self, session_id: &str) -> Result<(), DirectoryError>;

    /// Snapshot of the presence set.
    async fn connections(&self) -> Result<Vec<String>, DirectoryError>;

    /// Create a user account.
    async fn sign_up(&self, username: &str, password: &str) -> Result<User, DirectoryError>;

    /// Check credentials and return the matching user.
    async fn sign_in(&self, username: &str, password: &str) -> Result<User, DirectoryError>;

    async fn user_get(&self, uuid: &str) -> Result<User, DirectoryError>;

    /// Associate a signed-in user with a session.
    async fn attach_user(&self, session_id: &str, uuid: &str) -> Result<(), DirectoryError>;

    /// Clear the user associated with a session, returning it if there was one.
    async fn detach_user(&self, session_id: &str) -> Result<Option<String>, DirectoryError>;

    /// Users signed in on at least one session, deduplicated.
    async fn online_users(&self) -> Result<Vec<UserSummary>, DirectoryError>;

    /// Add a session to a channel. Returns `false` if it was already a member.
    async fn channel_join(&self, channel_id: &str, session_id: &str)
    -> Result<bool, DirectoryError>;

    /// Remove a session from a channel. Returns `false` if it was not a member.
    async fn channel_leave(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<bool, DirectoryError>;

    async fn channel_members(&self, channel_id: &str) -> Result<Vec<String>, DirectoryError>;

    async fn is_member(&self, channel_id: &str, session_id: &str) -> Result<bool, DirectoryError>;

    /// Publish a payload on a channel topic. Returns how many subscribers it
    /// was handed to.
    async fn publish(&self, channel_id: &str, payload: String) -> Result<usize, DirectoryError>;

    /// Subscribe to a channel topic.
    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, DirectoryError>;
}

/// A live subscription to one channel topic.
///
/// Payloads are delivered in publish order. A subscriber that falls more than
/// the topic's buffer behind skips the oldest payloads; the skipped count is
/// available from [`Subscription::lagged`].
#[derive(Debug)]
pub struct Subscription {
    channel_id: String,
    rx: broadcast::Receiver<String>,
    lagged: u64,
}

impl Subscription {
    pub fn new(channel_id: impl Into<String>, rx: broadcast::Receiver<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            rx,
            lagged: 0,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Wait for the next payload. Returns `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                    warn!(channel = %self.channel_id, "Subscription lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Total payloads skipped because this subscriber fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Stop receiving. Further publishes are not buffered for this subscriber.
    pub fn close(self) {
        debug!(channel = %self.channel_id, "Subscription closed");
    }
}
