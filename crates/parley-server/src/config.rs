//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`PARLEY_CONFIG`, or the first of the default paths)
//! - Environment variables (`PARLEY__SECTION__KEY`)

use anyhow::{Context, Result};
use parley_core::{ChatConfig, MessageConfig, NotifierConfig, PresenceConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Files searched when `PARLEY_CONFIG` is not set.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Default JWT secret. Only fit for local development.
pub const DEV_SECRET: &str = "change-me";

/// Invalid combinations of settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heartbeat.presence_ttl_ms ({ttl}) must exceed heartbeat.interval_ms ({interval})")]
    PresenceTtlTooShort { ttl: u64, interval: u64 },

    #[error("{0} requires a redis_url")]
    MissingRedisUrl(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Users loaded into the in-memory user store at startup.
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the chat WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum chat message length in characters.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Events queued per socket.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Broadcast buffer per channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Heartbeat and presence timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often a live socket refreshes its presence marker.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Lifetime of an online marker without refresh.
    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_ms: u64,

    /// How long an offline record keeps its `lastSeen`.
    #[serde(default = "default_last_seen_ttl")]
    pub last_seen_ttl_secs: u64,
}

/// Token verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Clock skew tolerated on `exp`.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

/// Which cache implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    #[serde(default)]
    pub redis_url: Option<String>,

    /// Size of the cached recent window per room.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,

    /// Lifetime of derived entries.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

/// Cross-process fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub redis_url: Option<String>,

    /// Redis pub/sub channel shared by all nodes.
    #[serde(default = "default_bus_channel")]
    pub channel: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A user known to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/chat".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_max_text_length() -> usize {
    4000
}

fn default_max_subscriptions() -> usize {
    512
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_presence_ttl() -> u64 {
    90_000
}

fn default_last_seen_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_jwt_secret() -> String {
    DEV_SECRET.to_string()
}

fn default_leeway() -> u64 {
    30
}

fn default_recent_limit() -> usize {
    50
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_bus_channel() -> String {
    "parley:fanout".to_string()
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
            auth: AuthConfig::default(),
            cache: CacheConfig::default(),
            bus: BusConfig::default(),
            metrics: MetricsConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_text_length: default_max_text_length(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            outbound_buffer: default_outbound_buffer(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            presence_ttl_ms: default_presence_ttl(),
            last_seen_ttl_secs: default_last_seen_ttl(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            leeway_secs: default_leeway(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            recent_limit: default_recent_limit(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: None,
            channel: default_bus_channel(),
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
    /// Load configuration from `PARLEY_CONFIG`, a default path, or defaults,
    /// with environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be parsed or the result is
    /// invalid.
    pub fn load() -> Result<Self> {
        let path = match std::env::var("PARLEY_CONFIG") {
            Ok(path) => Some(shellexpand::tilde(&path).into_owned()),
            Err(_) => CONFIG_PATHS
                .iter()
                .map(|p| shellexpand::tilde(p).into_owned())
                .find(|p| Path::new(p).exists()),
        };
        Self::from_sources(path.as_deref())
    }

    /// Build configuration from an optional file plus `PARLEY__*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// is invalid.
    pub fn from_sources(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Toml).required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PARLEY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .with_context(|| match path {
                Some(path) => format!("Failed to load config file: {path}"),
                None => "Failed to load configuration".to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Zero("heartbeat.interval_ms"));
        }
        if self.heartbeat.presence_ttl_ms <= self.heartbeat.interval_ms {
            return Err(ConfigError::PresenceTtlTooShort {
                ttl: self.heartbeat.presence_ttl_ms,
                interval: self.heartbeat.interval_ms,
            });
        }
        if self.cache.recent_limit == 0 {
            return Err(ConfigError::Zero("cache.recent_limit"));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl("cache.backend = \"redis\""));
        }
        if self.bus.enabled && self.bus.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl("bus.enabled"));
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Tuning for the chat service.
    #[must_use]
    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            notifier: NotifierConfig {
                max_subscriptions_per_connection: self.limits.max_subscriptions_per_connection,
                channel_capacity: self.limits.channel_capacity,
            },
            presence: PresenceConfig {
                ttl: Duration::from_millis(self.heartbeat.presence_ttl_ms),
                last_seen_ttl: Duration::from_secs(self.heartbeat.last_seen_ttl_secs),
            },
            messages: MessageConfig {
                recent_limit: self.cache.recent_limit,
                ttl: Duration::from_secs(self.cache.ttl_secs),
                max_text_length: self.limits.max_text_length,
            },
            outbound_buffer: self.limits.outbound_buffer,
        }
    }
}
