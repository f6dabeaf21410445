//! Configuration management
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Address producers post events to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Where to record the agent's PID (not written when unset)
    pub pid_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            pid_file: None,
        }
    }
}

/// Relay connection
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Relay WebSocket URL, e.g. `ws://relay.internal:8765/ws`
    pub ws_endpoint: String,
    /// Sent as `X-API-Key` on the handshake
    pub api_key: Option<String>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Upstream silence tolerated before the agent gives up
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
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

// Default value functions
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7777))
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    15
}

fn default_read_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&contents)
    }

    /// Configuration for `ws_endpoint` with every other value defaulted
    pub fn for_endpoint(ws_endpoint: impl Into<String>) -> Self {
        Self {
            agent: AgentConfig::default(),
            upstream: UpstreamConfig {
                ws_endpoint: ws_endpoint.into(),
                api_key: None,
                connect_attempts: default_connect_attempts(),
                retry_delay_ms: default_retry_delay_ms(),
                handshake_timeout_secs: default_handshake_timeout(),
                ping_interval_secs: default_ping_interval(),
                read_timeout_secs: default_read_timeout(),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.upstream.ws_endpoint.trim();
        if endpoint.is_empty() {
            anyhow::bail!("upstream.ws_endpoint must not be empty");
        }
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            anyhow::bail!("upstream.ws_endpoint must be a ws:// or wss:// URL");
        }
        if self.upstream.connect_attempts == 0 {
            anyhow::bail!("upstream.connect_attempts must be > 0");
        }
        if self.upstream.ping_interval_secs == 0 {
            anyhow::bail!("upstream.ping_interval_secs must be > 0");
        }
        if self.upstream.read_timeout_secs <= self.upstream.ping_interval_secs {
            anyhow::bail!("upstream.read_timeout_secs must exceed upstream.ping_interval_secs");
        }
        Ok(())
    }
}
