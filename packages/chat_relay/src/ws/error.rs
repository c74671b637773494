//! Error types, wire error codes, and their mapping from directory failures.

use chat_directory::DirectoryError;

/// Numeric codes carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    MalformedMessage = 4000,
    UnknownType = 4001,
    InvalidRequest = 4002,
    InvalidCredentials = 4010,
    UsernameTaken = 4011,
    NotSignedIn = 4012,
    InvalidChannel = 4020,
    NotAMember = 4021,
    DirectoryUnavailable = 5030,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Failure to turn a frame into a request, or a response into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown request type: {0}")]
    UnknownType(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl CodecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) | Self::Encode(_) => ErrorCode::MalformedMessage,
            Self::UnknownType(_) => ErrorCode::UnknownType,
        }
    }
}

/// A request the dispatcher could not carry out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error("not signed in")]
    NotSignedIn,

    #[error("invalid channel id: {0:?}")]
    InvalidChannel(String),

    #[error("not a member of channel {0}")]
    NotAMember(String),

    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::InvalidCredentials => ErrorCode::InvalidCredentials,
            Self::UsernameTaken(_) => ErrorCode::UsernameTaken,
            Self::NotSignedIn => ErrorCode::NotSignedIn,
            Self::InvalidChannel(_) => ErrorCode::InvalidChannel,
            Self::NotAMember(_) => ErrorCode::NotAMember,
            Self::DirectoryUnavailable(_) => ErrorCode::DirectoryUnavailable,
        }
    }
}

impl From<DirectoryError> for DispatchError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::InvalidCredentials => Self::InvalidCredentials,
            DirectoryError::UsernameTaken(name) => Self::UsernameTaken(name),
            DirectoryError::InvalidInput(msg) => Self::InvalidRequest(msg),
            DirectoryError::NotFound(what) => Self::InvalidRequest(format!("not found: {what}")),
            DirectoryError::AlreadyExists(what) => {
                Self::InvalidRequest(format!("already exists: {what}"))
            }
            DirectoryError::Unavailable(msg) => Self::DirectoryUnavailable(msg),
        }
    }
}

/// Failure to register a new session at connect time.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session already registered: {0}")]
    DuplicateSession(String),

    #[error("failed to register session {session_id}: {source}")]
    RegistrationFailure {
        session_id: String,
        #[source]
        source: DirectoryError,
    },
}
