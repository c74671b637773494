//! User records and argon2 credential handling.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;

/// A stored user account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub uuid: String,
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
}

impl User {
    /// Create a user with a fresh id and a hashed password.
    pub fn new(username: &str, password: &str) -> Result<Self, DirectoryError> {
        Ok(Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash_password(password)?,
        })
    }

    pub fn check_password(&self, password: &str) -> Result<bool, DirectoryError> {
        verify_password(password, &self.password_hash)
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            uuid: self.uuid.clone(),
            username: self.username.clone(),
        }
    }
}

/// Display-safe view of a user, suitable for sending to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSummary {
    pub uuid: String,
    pub username: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        user.summary()
    }
}

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String, DirectoryError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| DirectoryError::InvalidInput(format!("failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool, DirectoryError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| DirectoryError::Unavailable(format!("corrupt password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
