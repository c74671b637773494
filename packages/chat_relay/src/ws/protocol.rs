//! WebSocket Protocol Types
//!
//! Envelopes exchanged with clients. Every frame is a JSON object whose `type`
//! field selects the variant; the remaining fields belong to that variant.
//! Requests and responses share tag names (`signin`, `channel_join`, ...).

use chat_directory::UserSummary;
use serde::{Deserialize, Serialize};

use super::error::ErrorCode;

/// `type` tags a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "signin",
    "signup",
    "signout",
    "users",
    "channel_join",
    "channel_message",
    "channel_leave",
];

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientMessage {
    #[serde(rename = "signin")]
    SignIn { username: String, password: String },
    /// Create an account and sign it in on this session
    #[serde(rename = "signup")]
    SignUp { username: String, password: String },
    // Empty braces, not unit variants: serde only rejects extra fields on
    // struct variants of an internally tagged enum.
    #[serde(rename = "signout")]
    SignOut {},
    /// List signed-in users
    Users {},
    ChannelJoin { channel_id: String },
    ChannelMessage {
        channel_id: String,
        body: String,
        /// Addressee for a direct message routed through the channel
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_uuid: Option<String>,
    },
    ChannelLeave { channel_id: String },
}

impl ClientMessage {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignIn { .. } => "signin",
            Self::SignUp { .. } => "signup",
            Self::SignOut {} => "signout",
            Self::Users {} => "users",
            Self::ChannelJoin { .. } => "channel_join",
            Self::ChannelMessage { .. } => "channel_message",
            Self::ChannelLeave { .. } => "channel_leave",
        }
    }
}

/// A chat message as published on a channel topic and relayed to members.
///
/// `sender` and `recipient` are only filled in by the relay, from the uuids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessagePayload {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_uuid: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserSummary>,
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection
    Ready { session_id: String },
    #[serde(rename = "signin")]
    SignIn { user: UserSummary },
    #[serde(rename = "signup")]
    SignUp { user: UserSummary },
    #[serde(rename = "signout")]
    SignOut { session_id: String },
    Users { users: Vec<UserSummary> },
    ChannelJoin { channel_id: String },
    ChannelMessage(ChannelMessagePayload),
    ChannelLeave { channel_id: String },
    /// A rejected or undecodable request, echoing what was received
    Error {
        code: u16,
        error: String,
        data: serde_json::Value,
        session_id: String,
    },
}

impl ServerMessage {
    pub fn error(
        session_id: &str,
        code: ErrorCode,
        error: impl std::fmt::Display,
        data: serde_json::Value,
    ) -> Self {
        Self::Error {
            code: code.as_u16(),
            error: error.to_string(),
            data,
            session_id: session_id.to_string(),
        }
    }
}
