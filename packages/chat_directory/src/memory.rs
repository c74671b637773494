//! In-process directory: hash maps behind one lock, one broadcast channel per topic.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::directory::{Directory, Subscription};
use crate::error::DirectoryError;
use crate::user::{User, UserSummary};

/// Default per-topic buffer before slow subscribers start lagging.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

#[derive(Default)]
struct DirectoryState {
    connections: HashSet<String>,
    users: HashMap<String, User>,
    /// username -> uuid
    usernames: HashMap<String, String>,
    /// session -> uuid
    identities: HashMap<String, String>,
    /// channel -> member sessions
    channels: HashMap<String, HashSet<String>>,
    topics: HashMap<String, broadcast::Sender<String>>,
}

impl DirectoryState {
    /// Drop topics nobody is subscribed to. A sender without receivers
    /// buffers nothing, so a later subscribe recreates it losslessly.
    fn prune_topics(&mut self) {
        self.topics.retain(|_, tx| tx.receiver_count() > 0);
    }
}

pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
    topic_capacity: usize,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl MemoryDirectory {
    pub fn new(topic_capacity: usize) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            topic_capacity: topic_capacity.max(1),
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn add_connection(&self, session_id: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        if !state.connections.insert(session_id.to_string()) {
            return Err(DirectoryError::AlreadyExists(session_id.to_string()));
        }
        Ok(())
    }

    async fn del_connection(&self, session_id: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        state.connections.remove(session_id);
        state.identities.remove(session_id);
        for members in state.channels.values_mut() {
            members.remove(session_id);
        }
        state.channels.retain(|_, members| !members.is_empty());
        state.prune_topics();
        Ok(())
    }

    async fn connections(&self) -> Result<Vec<String>, DirectoryError> {
        let state = self.state.read().await;
        Ok(state.connections.iter().cloned().collect())
    }

    async fn sign_up(&self, username: &str, password: &str) -> Result<User, DirectoryError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DirectoryError::InvalidInput("username is required".into()));
        }
        if password.is_empty() {
            return Err(DirectoryError::InvalidInput("password is required".into()));
        }
        if self.state.read().await.usernames.contains_key(username) {
            return Err(DirectoryError::UsernameTaken(username.to_string()));
        }

        // Hash outside the lock; re-check the name under the write lock.
        let user = User::new(username, password)?;
        let mut state = self.state.write().await;
        if state.usernames.contains_key(username) {
            return Err(DirectoryError::UsernameTaken(username.to_string()));
        }
        state
            .usernames
            .insert(user.username.clone(), user.uuid.clone());
        state.users.insert(user.uuid.clone(), user.clone());
        debug!(user = %user.uuid, "Created user {}", user.username);
        Ok(user)
    }

    async fn sign_in(&self, username: &str, password: &str) -> Result<User, DirectoryError> {
        let user = {
            let state = self.state.read().await;
            state
                .usernames
                .get(username.trim())
                .and_then(|uuid| state.users.get(uuid))
                .cloned()
        };
        match user {
            Some(user) if user.check_password(password)? => Ok(user),
            _ => Err(DirectoryError::InvalidCredentials),
        }
    }

    async fn user_get(&self, uuid: &str) -> Result<User, DirectoryError> {
        let state = self.state.read().await;
        state
            .users
            .get(uuid)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("user {uuid}")))
    }

    async fn attach_user(&self, session_id: &str, uuid: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        if !state.connections.contains(session_id) {
            return Err(DirectoryError::NotFound(format!("session {session_id}")));
        }
        if !state.users.contains_key(uuid) {
            return Err(DirectoryError::NotFound(format!("user {uuid}")));
        }
        state
            .identities
            .insert(session_id.to_string(), uuid.to_string());
        Ok(())
    }

    async fn detach_user(&self, session_id: &str) -> Result<Option<String>, DirectoryError> {
        let mut state = self.state.write().await;
        Ok(state.identities.remove(session_id))
    }

    async fn online_users(&self) -> Result<Vec<UserSummary>, DirectoryError> {
        let state = self.state.read().await;
        // BTreeMap keeps the snapshot ordered by uuid and deduplicated.
        let online: BTreeMap<&str, UserSummary> = state
            .identities
            .values()
            .filter_map(|uuid| state.users.get(uuid))
            .map(|user| (user.uuid.as_str(), user.summary()))
            .collect();
        Ok(online.into_values().collect())
    }

    async fn channel_join(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.write().await;
        if !state.connections.contains(session_id) {
            return Err(DirectoryError::NotFound(format!("session {session_id}")));
        }
        Ok(state
            .channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(session_id.to_string()))
    }

    async fn channel_leave(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.write().await;
        state.prune_topics();
        let Some(members) = state.channels.get_mut(channel_id) else {
            return Ok(false);
        };
        let removed = members.remove(session_id);
        if members.is_empty() {
            state.channels.remove(channel_id);
        }
        Ok(removed)
    }

    async fn channel_members(&self, channel_id: &str) -> Result<Vec<String>, DirectoryError> {
        let state = self.state.read().await;
        Ok(state
            .channels
            .get(channel_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_member(&self, channel_id: &str, session_id: &str) -> Result<bool, DirectoryError> {
        let state = self.state.read().await;
        Ok(state
            .channels
            .get(channel_id)
            .is_some_and(|members| members.contains(session_id)))
    }

    async fn publish(&self, channel_id: &str, payload: String) -> Result<usize, DirectoryError> {
        let state = self.state.read().await;
        match state.topics.get(channel_id) {
            // send only fails when nobody is listening
            Some(tx) => Ok(tx.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, DirectoryError> {
        let mut state = self.state.write().await;
        state.prune_topics();
        let capacity = self.topic_capacity;
        let tx = state
            .topics
            .entry(channel_id.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(Subscription::new(channel_id, tx.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_connection_rejects_duplicates() {
        let dir = MemoryDirectory::default();
        dir.add_connection("s1").await.unwrap();
        let err = dir.add_connection("s1").await.unwrap_err();
        assert_eq!(err, DirectoryError::AlreadyExists("s1".into()));
        assert_eq!(dir.connections().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn del_connection_is_idempotent_and_clears_session_state() {
        let dir = MemoryDirectory::default();
        dir.add_connection("s1").await.unwrap();
        let user = dir.sign_up("alice", "pw").await.unwrap();
        dir.attach_user("s1", &user.uuid).await.unwrap();
        dir.channel_join("general", "s1").await.unwrap();

        dir.del_connection("s1").await.unwrap();
        dir.del_connection("s1").await.unwrap();

        assert!(dir.connections().await.unwrap().is_empty());
        assert!(dir.online_users().await.unwrap().is_empty());
        assert!(!dir.is_member("general", "s1").await.unwrap());
        // The user record itself survives the session.
        assert_eq!(dir.user_get(&user.uuid).await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let dir = MemoryDirectory::default();
        let created = dir.sign_up("alice", "hunter2").await.unwrap();
        let found = dir.sign_in("alice", "hunter2").await.unwrap();
        assert_eq!(created.uuid, found.uuid);

        assert_eq!(
            dir.sign_in("alice", "nope").await.unwrap_err(),
            DirectoryError::InvalidCredentials
        );
        assert_eq!(
            dir.sign_in("nobody", "hunter2").await.unwrap_err(),
            DirectoryError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn sign_up_validates_input() {
        let dir = MemoryDirectory::default();
        dir.sign_up("alice", "pw").await.unwrap();
        assert_eq!(
            dir.sign_up("alice", "other").await.unwrap_err(),
            DirectoryError::UsernameTaken("alice".into())
        );
        assert!(matches!(
            dir.sign_up("  ", "pw").await.unwrap_err(),
            DirectoryError::InvalidInput(_)
        ));
        assert!(matches!(
            dir.sign_up("bob", "").await.unwrap_err(),
            DirectoryError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn online_users_dedupes_across_sessions() {
        let dir = MemoryDirectory::default();
        let alice = dir.sign_up("alice", "pw").await.unwrap();
        dir.add_connection("s1").await.unwrap();
        dir.add_connection("s2").await.unwrap();
        dir.attach_user("s1", &alice.uuid).await.unwrap();
        dir.attach_user("s2", &alice.uuid).await.unwrap();

        let online = dir.online_users().await.unwrap();
        assert_eq!(online, vec![alice.summary()]);

        assert_eq!(dir.detach_user("s1").await.unwrap(), Some(alice.uuid.clone()));
        assert_eq!(dir.online_users().await.unwrap().len(), 1);
        dir.detach_user("s2").await.unwrap();
        assert!(dir.online_users().await.unwrap().is_empty());
        assert_eq!(dir.detach_user("s2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn attach_user_requires_known_session_and_user() {
        let dir = MemoryDirectory::default();
        let alice = dir.sign_up("alice", "pw").await.unwrap();
        assert!(matches!(
            dir.attach_user("ghost", &alice.uuid).await.unwrap_err(),
            DirectoryError::NotFound(_)
        ));
        dir.add_connection("s1").await.unwrap();
        assert!(matches!(
            dir.attach_user("s1", "no-such-user").await.unwrap_err(),
            DirectoryError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn channel_membership() {
        let dir = MemoryDirectory::default();
        dir.add_connection("s1").await.unwrap();
        dir.add_connection("s2").await.unwrap();

        assert!(dir.channel_join("general", "s1").await.unwrap());
        assert!(!dir.channel_join("general", "s1").await.unwrap());
        assert!(dir.channel_join("general", "s2").await.unwrap());

        let mut members = dir.channel_members("general").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["s1".to_string(), "s2".to_string()]);

        assert!(dir.channel_leave("general", "s1").await.unwrap());
        assert!(!dir.channel_leave("general", "s1").await.unwrap());
        assert!(!dir.is_member("general", "s1").await.unwrap());
        assert!(dir.is_member("general", "s2").await.unwrap());
        assert!(!dir.channel_leave("nowhere", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn channel_join_requires_connected_session() {
        let dir = MemoryDirectory::default();
        assert!(matches!(
            dir.channel_join("general", "ghost").await.unwrap_err(),
            DirectoryError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let dir = MemoryDirectory::default();
        let mut a = dir.subscribe("general").await.unwrap();
        let mut b = dir.subscribe("general").await.unwrap();
        let mut other = dir.subscribe("random").await.unwrap();

        let delivered = dir.publish("general", "hi".to_string()).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.as_deref(), Some("hi"));
        assert_eq!(b.recv().await.as_deref(), Some("hi"));

        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), other.recv()).await;
        assert!(pending.is_err(), "other topic must not receive");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let dir = MemoryDirectory::default();
        assert_eq!(dir.publish("empty", "x".into()).await.unwrap(), 0);

        let sub = dir.subscribe("empty").await.unwrap();
        sub.close();
        assert_eq!(dir.publish("empty", "y".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn topic_capacity_bounds_buffering() {
        let dir = MemoryDirectory::new(1);
        let mut sub = dir.subscribe("t").await.unwrap();
        dir.publish("t", "first".into()).await.unwrap();
        dir.publish("t", "second".into()).await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("second"));
        assert_eq!(sub.lagged(), 1);
    }

    async fn topic_count(dir: &MemoryDirectory) -> usize {
        dir.state.read().await.topics.len()
    }

    #[tokio::test]
    async fn unused_topics_are_dropped() {
        let dir = MemoryDirectory::default();
        dir.add_connection("s1").await.unwrap();
        for i in 0..100 {
            let channel = format!("room-{i}");
            dir.channel_join(&channel, "s1").await.unwrap();
            dir.subscribe(&channel).await.unwrap().close();
            dir.channel_leave(&channel, "s1").await.unwrap();
        }
        assert_eq!(topic_count(&dir).await, 0);

        // A subscription that outlives the leave is swept on disconnect.
        dir.channel_join("general", "s1").await.unwrap();
        let sub = dir.subscribe("general").await.unwrap();
        dir.channel_leave("general", "s1").await.unwrap();
        assert_eq!(topic_count(&dir).await, 1);
        sub.close();
        dir.del_connection("s1").await.unwrap();
        assert_eq!(topic_count(&dir).await, 0);
    }

    #[tokio::test]
    async fn live_topics_survive_pruning() {
        let dir = MemoryDirectory::default();
        dir.add_connection("s1").await.unwrap();
        let mut kept = dir.subscribe("kept").await.unwrap();
        dir.subscribe("dropped").await.unwrap().close();
        dir.channel_leave("kept", "s1").await.unwrap();

        assert_eq!(topic_count(&dir).await, 1);
        assert_eq!(dir.publish("kept", "still here".into()).await.unwrap(), 1);
        assert_eq!(kept.recv().await.as_deref(), Some("still here"));
    }
}
