use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 8080
//
//   env var:         CHAT_SERVER__PORT=8080   (double underscore = nesting)
//
//   platform:        PORT=8080                (maps to server.port)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of static client files served on unmatched paths.
    #[serde(default = "default_client_dir")]
    pub client_dir: PathBuf,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_dir: default_client_dir(),
        }
    }
}

/// Per-connection queue sizes (lives under `[websocket]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_relay_buffer_capacity")]
    pub relay_buffer_capacity: usize,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            relay_buffer_capacity: default_relay_buffer_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5555
}
fn default_client_dir() -> PathBuf {
    PathBuf::from("public")
}
fn default_send_queue_capacity() -> usize {
    100
}
fn default_relay_buffer_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config file → CHAT_* env vars → PORT.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_SERVER__HOST=127.0.0.1`  →  `server.host = "127.0.0.1"`
///   `CHAT_WEBSOCKET__SEND_QUEUE_CAPACITY=50`  →  `websocket.send_queue_capacity = 50`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("CHAT_").split("__"))
        .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
}

/// Command-line overrides, applied on top of the loaded figment.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub client_dir: PathBuf,
    pub websocket: WebSocketConfig,
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// Outbound frames queued per connection before writers wait
    pub send_queue_capacity: usize,
    /// Per-topic buffer before a slow relay starts skipping messages
    pub relay_buffer_capacity: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig, overrides: &CliOverrides) -> Result<Self> {
        let host = overrides.host.as_deref().unwrap_or(&fc.server.host);
        let port = overrides.port.unwrap_or(fc.server.port);
        let bind_addr = format!("{}:{}", host, port)
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

        Ok(Self {
            bind_addr,
            client_dir: fc.server.client_dir.clone(),
            websocket: WebSocketConfig {
                send_queue_capacity: fc.websocket.send_queue_capacity.max(1),
                relay_buffer_capacity: fc.websocket.relay_buffer_capacity.max(1),
            },
        })
    }
}
