//! Server configuration.

use std::time::Duration;

use crate::errors::ConfigError;

/// Built-in health route.
pub const HEALTH_PATH: &str = "/health";
/// Built-in metrics route.
pub const METRICS_PATH: &str = "/metrics";

/// Configuration for the push server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Route clients connect to.
    pub ws_path: String,
    /// Route operators post messages to.
    pub send_path: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// How often connections are pinged.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Bound on a single dispatch write.
    pub write_timeout: Duration,
    /// WebSocket read buffer size in bytes.
    pub read_buffer_size: usize,
    /// WebSocket write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Accepted `Origin` values. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/ws".into(),
            send_path: "/send".into(),
            max_connections: 10_000,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: 1024 * 1024,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_path("ws", &self.ws_path)?;
        check_path("send", &self.send_path)?;
        if self.ws_path == self.send_path {
            return Err(ConfigError::DuplicatePath(self.ws_path.clone()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(ConfigError::InvalidValue(
                "heartbeat timeout must not be shorter than the interval".into(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "write timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether a request with this `Origin` header may upgrade.
    ///
    /// Requests without an `Origin` header come from non-browser clients and
    /// are always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed_origins.is_empty() => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin)),
        }
    }
}

fn check_path(name: &'static str, path: &str) -> Result<(), ConfigError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(ConfigError::InvalidPath {
            name,
            path: path.to_owned(),
        });
    }
    if path == HEALTH_PATH || path == METRICS_PATH {
        return Err(ConfigError::ReservedPath(path.to_owned()));
    }
    Ok(())
}
