//! Presence, user records, channel membership and topic pub/sub for the chat relay.
//!
//! The relay consumes this crate only through the [`Directory`] trait. The
//! bundled [`MemoryDirectory`] keeps everything in process and fans topics out
//! over `tokio::sync::broadcast`.

pub mod directory;
pub mod error;
pub mod memory;
pub mod user;

pub use directory::{Directory, Subscription};
pub use error::DirectoryError;
pub use memory::MemoryDirectory;
pub use user::{User, UserSummary};
