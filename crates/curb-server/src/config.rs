//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (CURB_*)
//! - TOML configuration file
//!
//! Users are provisioned here too: authentication is an external concern,
//! so the server only carries a static token table.

use anyhow::{Context, Result};
use curb_core::{Role, User};
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

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Provisioned users.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the rider WebSocket endpoint.
    #[serde(default = "default_rider_path")]
    pub rider_path: String,

    /// Path for the driver WebSocket endpoint.
    #[serde(default = "default_driver_path")]
    pub driver_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Broadcast capacity per topic.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,

    /// Bounded outbound queue length per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
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

/// A provisioned user with its authentication token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// User identifier.
    pub id: u64,
    /// Username.
    pub username: String,
    /// Bearer token the user authenticates with.
    pub token: String,
    /// Role names (`"driver"`, `"rider"`).
    pub groups: Vec<Role>,
}

impl UserEntry {
    /// Build the domain user for this entry.
    #[must_use]
    pub fn to_user(&self) -> User {
        User::new(self.id, self.username.clone(), self.groups.clone())
    }
}

// Default value functions
fn default_host() -> String {
    std::env::var("CURB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("CURB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_rider_path() -> String {
    "/ws/rider".to_string()
}

fn default_driver_path() -> String {
    "/ws/driver".to_string()
}

fn default_max_subscriptions() -> usize {
    64
}

fn default_topic_capacity() -> usize {
    256
}

fn default_outbound_queue() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rider_path: default_rider_path(),
            driver_path: default_driver_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: default_max_subscriptions(),
            topic_capacity: default_topic_capacity(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = ["curb.toml", "/etc/curb/curb.toml", "~/.config/curb/curb.toml"];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
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

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }
}
