//! Configuration management
//!
//! Handles loading and validating relay configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener
    pub bind_addr: SocketAddr,
    /// Route that accepts WebSocket upgrades
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,
    /// Accepted `Origin` header values (empty = any origin)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl ServerConfig {
    /// Check an upgrade request's `Origin` header against the allow list
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
            None => false,
        }
    }
}

/// Fan-out behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Per-connection outbound queue capacity in frames.
    /// A peer whose queue is full when a broadcast arrives is evicted.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// How long the writer waits for the close handshake before dropping the socket
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// How long shutdown waits for connections to unregister
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl RelayConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            close_timeout_ms: default_close_timeout_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Server-initiated keep-alive probing
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Send pings and close peers that stop answering
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between pings
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Silence allowed before a peer is closed, counted in whole missed
    /// intervals. The close lands between `timeout_secs` and
    /// `timeout_secs + interval_secs` after the last inbound frame.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,
    /// Exporter bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Routes served next to the WebSocket endpoint
const RESERVED_PATHS: &[&str] = &["/", "/healthz", "/connections", "/stats"];

// Default value functions
fn default_ws_path() -> String { "/ws".to_string() }
fn default_backlog() -> i32 { 1024 }
fn default_outbound_queue() -> usize { 256 }
fn default_close_timeout_ms() -> u64 { 1000 }
fn default_drain_timeout_secs() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_heartbeat_interval() -> u64 { 20 }
fn default_heartbeat_timeout() -> u64 { 60 }
fn default_metrics_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 9090)) }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration for a listener on `bind_addr` with every other value defaulted
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self {
            server: ServerConfig {
                bind_addr,
                ws_path: default_ws_path(),
                max_connections: 0,
                allowed_origins: Vec::new(),
                backlog: default_backlog(),
            },
            relay: RelayConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.server.ws_path.starts_with('/') {
            anyhow::bail!("server.ws_path must start with '/'");
        }
        if RESERVED_PATHS.contains(&self.server.ws_path.as_str()) {
            anyhow::bail!(
                "server.ws_path {:?} collides with a monitoring route",
                self.server.ws_path
            );
        }
        if self.server.backlog <= 0 {
            anyhow::bail!("server.backlog must be > 0");
        }
        if self.relay.outbound_queue == 0 {
            anyhow::bail!("relay.outbound_queue must be > 0");
        }
        if self.heartbeat.enabled {
            if self.heartbeat.interval_secs == 0 {
                anyhow::bail!("heartbeat.interval_secs must be > 0");
            }
            if self.heartbeat.timeout_secs < self.heartbeat.interval_secs {
                anyhow::bail!("heartbeat.timeout_secs must be >= heartbeat.interval_secs");
            }
        }
        Ok(())
    }
}
