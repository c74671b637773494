use async_trait::async_trait;
use chat_directory::{Directory, DirectoryError, MemoryDirectory, Subscription, User, UserSummary};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::config::{CliOverrides, FileConfig, ServerConfig};
use crate::metrics::ServerMetrics;
use crate::ws::dispatch::ConnectionContext;
use crate::ws::SessionRegistry;
use crate::ws::protocol::ServerMessage;
use crate::ws::writer::ConnectionWriter;

/// Build an `AppState` over a fresh in-memory directory.
pub fn test_app_state() -> AppState {
    test_app_state_with(Arc::new(MemoryDirectory::default()))
}

/// Like `test_app_state`, but over the given directory.
pub fn test_app_state_with(directory: Arc<dyn Directory>) -> AppState {
    let server_config = ServerConfig::from_file(&FileConfig::default(), &CliOverrides::default())
        .expect("default config");
    AppState {
        registry: Arc::new(SessionRegistry::new(directory)),
        server_config: Arc::new(server_config),
        metrics: Arc::new(ServerMetrics::new()),
    }
}

/// A dispatcher context for `session_id`, already present in `directory`.
///
/// The receiver stands in for the socket writer.
pub(crate) async fn test_context(
    session_id: &str,
    directory: Arc<dyn Directory>,
) -> (
    ConnectionContext,
    tokio::sync::mpsc::Receiver<ServerMessage>,
) {
    directory
        .add_connection(session_id)
        .await
        .expect("add connection");
    let (writer, rx) = ConnectionWriter::channel(64);
    let ctx = ConnectionContext::new(
        session_id,
        directory,
        writer,
        CancellationToken::new(),
        Arc::new(ServerMetrics::new()),
    );
    (ctx, rx)
}

/// A `MemoryDirectory` whose calls can be switched to fail with
/// `DirectoryError::Unavailable`.
#[derive(Default)]
pub struct FlakyDirectory {
    inner: MemoryDirectory,
    fail_add: AtomicBool,
    fail_del: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_all: AtomicBool,
}

impl FlakyDirectory {
    pub fn fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    pub fn fail_del(&self, fail: bool) {
        self.fail_del.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), DirectoryError> {
        if self.fail_all.load(Ordering::SeqCst) || flag.load(Ordering::SeqCst) {
            Err(DirectoryError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn check_all(&self) -> Result<(), DirectoryError> {
        self.check(&self.fail_all)
    }
}

#[async_trait]
impl Directory for FlakyDirectory {
    async fn add_connection(&self, session_id: &str) -> Result<(), DirectoryError> {
        self.check(&self.fail_add)?;
        self.inner.add_connection(session_id).await
    }

    async fn del_connection(&self, session_id: &str) -> Result<(), DirectoryError> {
        self.check(&self.fail_del)?;
        self.inner.del_connection(session_id).await
    }

    async fn connections(&self) -> Result<Vec<String>, DirectoryError> {
        self.check_all()?;
        self.inner.connections().await
    }

    async fn sign_up(&self, username: &str, password: &str) -> Result<User, DirectoryError> {
        self.check_all()?;
        self.inner.sign_up(username, password).await
    }

    async fn sign_in(&self, username: &str, password: &str) -> Result<User, DirectoryError> {
        self.check_all()?;
        self.inner.sign_in(username, password).await
    }

    async fn user_get(&self, uuid: &str) -> Result<User, DirectoryError> {
        self.check_all()?;
        self.inner.user_get(uuid).await
    }

    async fn attach_user(&self, session_id: &str, uuid: &str) -> Result<(), DirectoryError> {
        self.check_all()?;
        self.inner.attach_user(session_id, uuid).await
    }

    async fn detach_user(&self, session_id: &str) -> Result<Option<String>, DirectoryError> {
        self.check_all()?;
        self.inner.detach_user(session_id).await
    }

    async fn online_users(&self) -> Result<Vec<UserSummary>, DirectoryError> {
        self.check_all()?;
        self.inner.online_users().await
    }

    async fn channel_join(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<bool, DirectoryError> {
        self.check_all()?;
        self.inner.channel_join(channel_id, session_id).await
    }

    async fn channel_leave(
        &self,
        channel_id: &str,
        session_id: &str,
    ) -> Result<bool, DirectoryError> {
        self.check_all()?;
        self.inner.channel_leave(channel_id, session_id).await
    }

    async fn channel_members(&self, channel_id: &str) -> Result<Vec<String>, DirectoryError> {
        self.check_all()?;
        self.inner.channel_members(channel_id).await
    }

    async fn is_member(&self, channel_id: &str, session_id: &str) -> Result<bool, DirectoryError> {
        self.check_all()?;
        self.inner.is_member(channel_id, session_id).await
    }

    async fn publish(&self, channel_id: &str, payload: String) -> Result<usize, DirectoryError> {
        self.check_all()?;
        self.inner.publish(channel_id, payload).await
    }

    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, DirectoryError> {
        self.check(&self.fail_subscribe)?;
        self.inner.subscribe(channel_id).await
    }
}

/// Serve `state` on an ephemeral loopback port.
pub async fn spawn_test_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = crate::app_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

/// A WebSocket client speaking JSON envelopes.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub session_id: String,
}

impl TestClient {
    /// Connect and consume the `ready` frame.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let mut client = Self {
            ws,
            session_id: String::new(),
        };
        let ready = client.recv().await;
        assert_eq!(ready["type"], "ready", "first frame was {ready}");
        client.session_id = ready["session_id"]
            .as_str()
            .expect("session id")
            .to_string();
        client
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send");
    }

    /// Next text frame as JSON; panics after five seconds.
    pub async fn recv(&mut self) -> serde_json::Value {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next text frame as JSON, or `None` if nothing arrives in time.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).expect("json frame"));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
