//! Session Registry
//!
//! Tracks every live connection in this process and mirrors its presence in
//! the shared directory. A session is registered before the WebSocket upgrade
//! completes and unregistered exactly once, whichever way the connection ends.

use chat_directory::{Directory, DirectoryError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::RegistryError;
use super::writer::ConnectionWriter;

/// What the registry keeps for a serving connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub writer: ConnectionWriter,
    pub cancel: CancellationToken,
}

pub struct SessionRegistry {
    directory: Arc<dyn Directory>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Register a new session id with the directory.
    ///
    /// The returned guard unregisters the session when released or dropped.
    pub async fn register(self: &Arc<Self>, session_id: &str) -> Result<SessionGuard, RegistryError> {
        if self.connections.read().await.contains_key(session_id) {
            return Err(RegistryError::DuplicateSession(session_id.to_string()));
        }

        match self.directory.add_connection(session_id).await {
            Ok(()) => {}
            Err(DirectoryError::AlreadyExists(_)) => {
                return Err(RegistryError::DuplicateSession(session_id.to_string()));
            }
            Err(source) => {
                return Err(RegistryError::RegistrationFailure {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        }

        info!(session_id, "Session registered");
        Ok(SessionGuard {
            registry: self.clone(),
            session_id: session_id.to_string(),
            released: false,
        })
    }

    /// Forget a session locally and in the directory. Safe to call twice.
    ///
    /// A directory failure is logged; the local entry is removed regardless.
    pub async fn unregister(&self, session_id: &str) {
        self.connections.write().await.remove(session_id);
        match self.directory.del_connection(session_id).await {
            Ok(()) => info!(session_id, "Session unregistered"),
            Err(e) => warn!(session_id, "Failed to remove session from directory: {}", e),
        }
    }

    /// Attach the live connection handle once the socket is serving.
    pub async fn add(&self, session_id: &str, handle: ConnectionHandle) {
        self.connections
            .write()
            .await
            .insert(session_id.to_string(), handle);
    }

    pub async fn remove(&self, session_id: &str) -> Option<ConnectionHandle> {
        self.connections.write().await.remove(session_id)
    }

    #[cfg(test)]
    pub async fn lookup(&self, session_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(session_id).cloned()
    }

    #[cfg(test)]
    pub async fn session_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Ask every serving connection to shut down. Returns how many were signalled.
    pub async fn close_all(&self) -> usize {
        let connections = self.connections.read().await;
        for handle in connections.values() {
            handle.cancel.cancel();
        }
        debug!("Signalled {} connections to close", connections.len());
        connections.len()
    }
}

/// Proof that a session id is registered.
///
/// Call [`SessionGuard::release`] on the normal path. If the guard is dropped
/// instead (for example when the upgrade never completes), unregistration is
/// spawned onto the current runtime.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
    released: bool,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn release(mut self) {
        self.released = true;
        self.registry.unregister(&self.session_id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = self.registry.clone();
        let session_id = std::mem::take(&mut self.session_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(session_id = %session_id, "Session guard dropped, unregistering");
                handle.spawn(async move { registry.unregister(&session_id).await });
            }
            Err(_) => warn!(session_id = %session_id, "Session guard dropped outside a runtime"),
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session_id", &self.session_id)
            .field("released", &self.released)
            .finish()
    }
}
