//! Settings types.
//!
//! All structs deserialize from camelCase JSON and fall back to their
//! [`Default`] for any missing key, so a settings file only needs the values
//! it overrides.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Network, routing and connection settings.
    pub server: ServerSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

/// Network, routing and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` lets the OS pick one).
    pub port: u16,
    /// Path accepting WebSocket upgrade requests.
    pub ws_path: String,
    /// Path accepting addressed-message submissions.
    pub send_path: String,
    /// Maximum number of live connections across all identities.
    pub max_connections: usize,
    /// Interval between server pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Upper bound for a single outbound write during dispatch, in milliseconds.
    pub write_timeout_ms: u64,
    /// WebSocket read buffer size in bytes.
    pub read_buffer_size: usize,
    /// WebSocket write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Origins allowed to upgrade. Empty accepts every origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9870,
            ws_path: "/ws".to_string(),
            send_path: "/send".to_string(),
            max_connections: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            write_timeout_ms: 10_000,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: 1024 * 1024,
            allowed_origins: Vec::new(),
        }
    }
}

/// Output format of the log subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` takes precedence).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
