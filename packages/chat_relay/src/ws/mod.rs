//! WebSocket Chat Relay
//!
//! One WebSocket connection per client session that:
//! - Registers the session with the shared directory before upgrading
//! - Decodes typed requests and answers them through a single writer
//! - Fans channel messages out through one relay task per joined channel

pub mod codec;
pub(crate) mod dispatch;
pub mod error;
mod handler;
pub mod protocol;
pub(crate) mod registry;
mod relay;
pub(crate) mod writer;

// Re-export the main types and functions
pub use handler::handle_connection;
pub use registry::SessionRegistry;
