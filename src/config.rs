//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Service name, also the namespace of every TCP session id
    #[serde(default = "default_name")]
    pub name: String,

    /// Address both listeners bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Binary protocol (TCP edge) port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// WebSocket gateway port
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// Outbound queue capacity per TCP session (0 = synchronous sends)
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,

    /// TCP heartbeat timeout in seconds
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Idle frame buffers kept by the shared pool
    #[serde(default = "default_max_pooled_buffers")]
    pub max_pooled_buffers: usize,

    /// Use the in-process backend instead of remote services
    #[serde(default)]
    pub dev_mode: bool,

    /// Log output format: `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// WebSocket gateway settings
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Upstream service addresses
    #[serde(default)]
    pub services: ServicesConfig,
}

/// WebSocket gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Outbound queue capacity per connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

/// Upstream service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_auth_addr")]
    pub auth_addr: String,

    #[serde(default = "default_message_addr")]
    pub message_addr: String,

    #[serde(default = "default_presence_addr")]
    pub presence_addr: String,

    #[serde(default = "default_im_addr")]
    pub im_addr: String,

    /// Upper bound for every upstream call, in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

// Default value functions
fn default_name() -> String {
    "beehive".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    9898
}

fn default_websocket_port() -> u16 {
    8080
}

fn default_send_queue_size() -> usize {
    1024
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_max_pooled_buffers() -> usize {
    crate::net::buffer::DEFAULT_MAX_POOLED
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    30
}

fn default_send_buffer() -> usize {
    256
}

fn default_auth_addr() -> String {
    "http://127.0.0.1:9001".to_string()
}

fn default_message_addr() -> String {
    "http://127.0.0.1:9002".to_string()
}

fn default_presence_addr() -> String {
    "http://127.0.0.1:9003".to_string()
}

fn default_im_addr() -> String {
    "http://127.0.0.1:9004".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            ping_interval_secs: default_ping_interval(),
            send_buffer: default_send_buffer(),
        }
    }
}

impl WebSocketConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            auth_addr: default_auth_addr(),
            message_addr: default_message_addr(),
            presence_addr: default_presence_addr(),
            im_addr: default_im_addr(),
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

impl ServicesConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            name: default_name(),
            host: default_host(),
            tcp_port: default_tcp_port(),
            websocket_port: default_websocket_port(),
            send_queue_size: default_send_queue_size(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            max_pooled_buffers: default_max_pooled_buffers(),
            dev_mode: false,
            log_format: default_log_format(),
            websocket: WebSocketConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("BEEHIVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("BEEHIVE_NAME") {
            self.name = val;
        }
        if let Ok(val) = env::var("BEEHIVE_HOST") {
            self.host = val;
        }
        if let Ok(val) = env::var("BEEHIVE_TCP_PORT") {
            if let Ok(port) = val.parse() {
                self.tcp_port = port;
            }
        }
        if let Ok(val) = env::var("BEEHIVE_WEBSOCKET_PORT") {
            if let Ok(port) = val.parse() {
                self.websocket_port = port;
            }
        }
        if let Ok(val) = env::var("BEEHIVE_SEND_QUEUE_SIZE") {
            if let Ok(size) = val.parse() {
                self.send_queue_size = size;
            }
        }
        if let Ok(val) = env::var("BEEHIVE_HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.heartbeat_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("BEEHIVE_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("BEEHIVE_LOG_FORMAT") {
            self.log_format = val;
        }

        if let Ok(val) = env::var("BEEHIVE_AUTH_ADDR") {
            self.services.auth_addr = val;
        }
        if let Ok(val) = env::var("BEEHIVE_MESSAGE_ADDR") {
            self.services.message_addr = val;
        }
        if let Ok(val) = env::var("BEEHIVE_PRESENCE_ADDR") {
            self.services.presence_addr = val;
        }
        if let Ok(val) = env::var("BEEHIVE_IM_ADDR") {
            self.services.im_addr = val;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(':') {
            anyhow::bail!("Name must be non-empty and must not contain ':'");
        }

        if self.tcp_port == self.websocket_port && self.tcp_port != 0 {
            anyhow::bail!("TCP port and WebSocket port must be different");
        }

        if self.heartbeat_timeout_secs == 0 {
            anyhow::bail!("Heartbeat timeout must be greater than 0");
        }

        let ws = &self.websocket;
        if ws.read_timeout_secs == 0 || ws.write_timeout_secs == 0 || ws.ping_interval_secs == 0 {
            anyhow::bail!("WebSocket timeouts and ping interval must be greater than 0");
        }
        if ws.send_buffer == 0 {
            anyhow::bail!("WebSocket send buffer must be greater than 0");
        }

        if self.services.rpc_timeout_secs == 0 {
            anyhow::bail!("RPC timeout must be greater than 0");
        }

        if !self.dev_mode {
            let services = &self.services;
            for (name, addr) in [
                ("auth", &services.auth_addr),
                ("message", &services.message_addr),
                ("presence", &services.presence_addr),
                ("im", &services.im_addr),
            ] {
                if addr.is_empty() {
                    anyhow::bail!("Address of the {} service is required", name);
                }
            }
        }

        match self.log_format.as_str() {
            "pretty" | "json" => {}
            other => anyhow::bail!("Unknown log format: {}", other),
        }

        Ok(())
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.tcp_port)
            .parse()
            .context("Invalid TCP listen address")
    }

    pub fn websocket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.websocket_port)
            .parse()
            .context("Invalid WebSocket listen address")
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}
