//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PALAVER_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use palaver_core::{
    DirectoryConfig, HubConfig, OverflowPolicy, QueueConfig, RegistryConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint path.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Outbound delivery queue settings.
    #[serde(default)]
    pub queue: DeliveryQueueConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,
}

/// Outbound delivery queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryQueueConfig {
    /// Maximum queued events per connection.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Policy when a connection's queue is full.
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Handshake/connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PALAVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PALAVER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_max_rooms_per_connection() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    256
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::DropOldest
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            limits: LimitsConfig::default(),
            queue: DeliveryQueueConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms: default_max_rooms(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
        }
    }
}

impl Default for DeliveryQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            overflow: default_overflow(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default paths, or defaults with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "palaver.toml",
            "/etc/palaver/palaver.toml",
            "~/.config/palaver/palaver.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The hub configuration derived from this server configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            registry: RegistryConfig {
                max_connections: self.limits.max_connections,
                queue: QueueConfig {
                    capacity: self.queue.capacity,
                    overflow: self.queue.overflow,
                },
            },
            directory: DirectoryConfig {
                max_rooms: self.limits.max_rooms,
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.websocket_path, "/ws");
        assert_eq!(config.queue.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [queue]
            capacity = 64
            overflow = "drop_newest"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.queue.capacity, 64);
        assert_eq!(config.queue.overflow, OverflowPolicy::DropNewest);
        // Untouched sections fall back to defaults.
        assert_eq!(config.limits.max_rooms, 10_000);
    }

    #[test]
    fn test_hub_config_mapping() {
        let config = Config::default();
        let hub = config.hub_config();
        assert_eq!(hub.registry.max_connections, config.limits.max_connections);
        assert_eq!(hub.registry.queue.capacity, config.queue.capacity);
        assert_eq!(hub.directory.max_rooms, config.limits.max_rooms);
    }
}
