//! Directory error type.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("username taken: {0}")]
    UsernameTaken(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl DirectoryError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::InvalidCredentials => "invalid_credentials",
            Self::UsernameTaken(_) => "username_taken",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
