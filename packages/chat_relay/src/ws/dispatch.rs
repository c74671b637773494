//! Request dispatcher.
//!
//! Maps each decoded [`ClientMessage`] to directory calls and relay changes,
//! returning the reply to write back (if any). Failures come back as
//! [`DispatchError`]s; turning them into error envelopes is the caller's job.

use chat_directory::{Directory, UserSummary};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;

use super::error::DispatchError;
use super::protocol::{ChannelMessagePayload, ClientMessage, ServerMessage};
use super::relay::RelaySet;
use super::writer::ConnectionWriter;

/// Longest accepted channel id.
pub const MAX_CHANNEL_ID_LEN: usize = 128;

/// Per-connection state the dispatcher reads and updates.
pub(crate) struct ConnectionContext {
    pub session_id: String,
    pub directory: Arc<dyn Directory>,
    pub writer: ConnectionWriter,
    pub relays: RelaySet,
    pub metrics: Arc<ServerMetrics>,
    /// Signed-in user, mirrored from the directory's session identity.
    user: RwLock<Option<UserSummary>>,
}

impl ConnectionContext {
    pub fn new(
        session_id: impl Into<String>,
        directory: Arc<dyn Directory>,
        writer: ConnectionWriter,
        cancel: CancellationToken,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            relays: RelaySet::new(session_id.clone(), cancel),
            session_id,
            directory,
            writer,
            metrics,
            user: RwLock::new(None),
        }
    }

    pub async fn current_user(&self) -> Option<UserSummary> {
        self.user.read().await.clone()
    }
}

/// Channel ids are 1 to [`MAX_CHANNEL_ID_LEN`] characters of ASCII
/// alphanumerics, `-`, `_`, `.` or `:`.
pub fn validate_channel_id(channel_id: &str) -> Result<(), DispatchError> {
    let valid = !channel_id.is_empty()
        && channel_id.len() <= MAX_CHANNEL_ID_LEN
        && channel_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(DispatchError::InvalidChannel(channel_id.to_string()))
    }
}

/// Handle one request.
pub(crate) async fn dispatch_client_message(
    ctx: &ConnectionContext,
    msg: ClientMessage,
) -> Result<Option<ServerMessage>, DispatchError> {
    match msg {
        ClientMessage::SignIn { username, password } => {
            let user = ctx.directory.sign_in(&username, &password).await?;
            let user = attach(ctx, user.summary()).await?;
            info!(session_id = %ctx.session_id, username = %user.username, "Signed in");
            Ok(Some(ServerMessage::SignIn { user }))
        }

        ClientMessage::SignUp { username, password } => {
            let user = ctx.directory.sign_up(&username, &password).await?;
            let user = attach(ctx, user.summary()).await?;
            info!(session_id = %ctx.session_id, username = %user.username, "Signed up");
            Ok(Some(ServerMessage::SignUp { user }))
        }

        ClientMessage::SignOut {} => {
            // Keep the local identity until the directory has dropped it too.
            let remote = ctx.directory.detach_user(&ctx.session_id).await?;
            let local = ctx.user.write().await.take();
            if local.is_none() && remote.is_none() {
                return Err(DispatchError::NotSignedIn);
            }
            info!(session_id = %ctx.session_id, "Signed out");
            Ok(Some(ServerMessage::SignOut {
                session_id: ctx.session_id.clone(),
            }))
        }

        ClientMessage::Users {} => {
            let users = ctx.directory.online_users().await?;
            Ok(Some(ServerMessage::Users { users }))
        }

        ClientMessage::ChannelJoin { channel_id } => {
            validate_channel_id(&channel_id)?;
            join_channel(ctx, &channel_id).await?;
            Ok(Some(ServerMessage::ChannelJoin { channel_id }))
        }

        ClientMessage::ChannelMessage {
            channel_id,
            body,
            recipient_uuid,
        } => {
            validate_channel_id(&channel_id)?;
            if !ctx.directory.is_member(&channel_id, &ctx.session_id).await? {
                return Err(DispatchError::NotAMember(channel_id));
            }
            let payload = ChannelMessagePayload {
                channel_id: channel_id.clone(),
                sender_uuid: ctx.current_user().await.map(|u| u.uuid),
                recipient_uuid,
                body,
                ..Default::default()
            };
            let payload = serde_json::to_string(&payload)
                .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
            let receivers = ctx.directory.publish(&channel_id, payload).await?;
            debug!(session_id = %ctx.session_id, channel = %channel_id, receivers, "Published channel message");
            Ok(None)
        }

        ClientMessage::ChannelLeave { channel_id } => {
            validate_channel_id(&channel_id)?;
            // Delivery stops even if the directory cannot record the leave.
            let had_relay = ctx.relays.stop(&channel_id).await;
            let was_member = ctx
                .directory
                .channel_leave(&channel_id, &ctx.session_id)
                .await?;
            if !was_member && !had_relay {
                return Err(DispatchError::NotAMember(channel_id));
            }
            info!(session_id = %ctx.session_id, channel = %channel_id, "Left channel");
            Ok(Some(ServerMessage::ChannelLeave { channel_id }))
        }
    }
}

async fn attach(ctx: &ConnectionContext, user: UserSummary) -> Result<UserSummary, DispatchError> {
    ctx.directory
        .attach_user(&ctx.session_id, &user.uuid)
        .await?;
    *ctx.user.write().await = Some(user.clone());
    Ok(user)
}

/// Record membership and make sure exactly one relay runs for the channel.
async fn join_channel(ctx: &ConnectionContext, channel_id: &str) -> Result<(), DispatchError> {
    let newly_joined = ctx
        .directory
        .channel_join(channel_id, &ctx.session_id)
        .await?;

    if ctx.relays.contains(channel_id).await {
        debug!(session_id = %ctx.session_id, channel = %channel_id, "Already relaying, join deduplicated");
        return Ok(());
    }

    let subscription = match ctx.directory.subscribe(channel_id).await {
        Ok(s) => s,
        Err(e) => {
            if newly_joined {
                rollback_join(ctx, channel_id).await;
            }
            return Err(e.into());
        }
    };

    if !ctx
        .relays
        .start(
            subscription,
            ctx.writer.clone(),
            ctx.directory.clone(),
            ctx.metrics.clone(),
        )
        .await
    {
        // Only refused once the connection is closing.
        if newly_joined {
            rollback_join(ctx, channel_id).await;
        }
        return Err(DispatchError::InvalidRequest(
            "connection is closing".to_string(),
        ));
    }

    info!(session_id = %ctx.session_id, channel = %channel_id, "Joined channel");
    Ok(())
}

async fn rollback_join(ctx: &ConnectionContext, channel_id: &str) {
    if let Err(e) = ctx.directory.channel_leave(channel_id, &ctx.session_id).await {
        warn!(session_id = %ctx.session_id, channel = %channel_id, "Failed to roll back join: {}", e);
    }
}
