//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via M2MP_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listeners.
    pub network: NetworkConfig,
    /// Session timing and queue sizes.
    pub session: SessionConfig,
    /// Message bus topics.
    pub bus: BusConfig,
    /// Registry and time-series storage.
    pub storage: StorageConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("M2MP_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.session.apply_env_overrides();
        self.bus.apply_env_overrides();
        self.storage.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.frame_queue == 0 || self.session.inbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "session queue sizes must be at least 1".to_string(),
            ));
        }
        if self.session.tick_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session.tick_secs must be positive".to_string(),
            ));
        }
        if self.bus.receivers_topic.is_empty() || self.bus.events_topic.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus topics must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Binary protocol listener.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// ALIP listener, disabled when unset.
    #[serde(with = "opt_socket_addr_serde")]
    pub alip_bind_addr: Option<SocketAddr>,
    /// Maximum concurrent connections over both listeners.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], m2mp_protocol::DEFAULT_PORT)),
            alip_bind_addr: Some(SocketAddr::from((
                [0, 0, 0, 0],
                m2mp_protocol::DEFAULT_ALIP_PORT,
            ))),
            max_connections: 10_000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("M2MP_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("M2MP_ALIP_BIND") {
            if addr.is_empty() || addr == "off" {
                self.alip_bind_addr = None;
            } else if let Ok(parsed) = addr.parse() {
                self.alip_bind_addr = Some(parsed);
            }
        }

        if let Ok(max) = std::env::var("M2MP_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Session timing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay before an unidentified connection is dropped.
    pub ident_timeout_secs: u64,
    /// Liveness check period.
    pub tick_secs: u64,
    /// Receive silence after which the server pings.
    pub ping_after_secs: u64,
    /// Minimum time since the last send before pinging.
    pub min_send_gap_secs: u64,
    /// Receive silence after which the connection is closed.
    pub idle_ceiling_secs: u64,
    /// Window during which an identical setting is not pushed again.
    pub setting_debounce_secs: u64,
    /// Decoded frames buffered between the read task and the session.
    pub frame_queue: usize,
    /// Bus messages buffered per session.
    pub inbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ident_timeout_secs: 30,
            tick_secs: 60,
            ping_after_secs: 15 * 60,
            min_send_gap_secs: 30,
            idle_ceiling_secs: 12 * 3600,
            setting_debounce_secs: 40,
            frame_queue: 3,
            inbox_capacity: 10,
        }
    }
}

impl SessionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(secs) = std::env::var("M2MP_IDENT_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.ident_timeout_secs = n;
            }
        }

        if let Ok(secs) = std::env::var("M2MP_TICK") {
            if let Ok(n) = secs.parse() {
                self.tick_secs = n;
            }
        }

        if let Ok(secs) = std::env::var("M2MP_IDLE_CEILING") {
            if let Ok(n) = secs.parse() {
                self.idle_ceiling_secs = n;
            }
        }
    }

    pub fn ident_timeout(&self) -> Duration {
        Duration::from_secs(self.ident_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Returns the liveness and debounce thresholds used by sessions.
    pub fn policy(&self) -> crate::session::SessionPolicy {
        crate::session::SessionPolicy {
            ping_after: Duration::from_secs(self.ping_after_secs),
            min_send_gap: Duration::from_secs(self.min_send_gap_secs),
            idle_ceiling: Duration::from_secs(self.idle_ceiling_secs),
            setting_debounce: Duration::from_secs(self.setting_debounce_secs),
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Topic carrying calls addressed to sessions.
    pub receivers_topic: String,
    /// Topic for lifecycle events.
    pub events_topic: String,
    /// Target for data channels no routing rule matches.
    pub default_target: String,
    /// Per-topic buffer of the in-process bus.
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            receivers_topic: crate::bus::TOPIC_RECEIVERS.to_string(),
            events_topic: crate::bus::TOPIC_GENERAL_EVENTS.to_string(),
            default_target: "converter-m2mp".to_string(),
            channel_capacity: 1024,
        }
    }
}

impl BusConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(target) = std::env::var("M2MP_DEFAULT_TARGET") {
            if !target.is_empty() {
                self.default_target = target;
            }
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Registry snapshot file, in-memory only when unset.
    pub registry_file: Option<PathBuf>,
    /// Directory of firmware files served over ALIP.
    pub firmware_dir: Option<PathBuf>,
    /// Samples kept per series by the in-memory store.
    pub samples_per_series: usize,
    /// Attempts to store a time-series sample.
    pub sample_retry_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub sample_retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            registry_file: None,
            firmware_dir: None,
            samples_per_series: 10_000,
            sample_retry_attempts: 10,
            sample_retry_delay_ms: 500,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("M2MP_REGISTRY_FILE") {
            self.registry_file = Some(PathBuf::from(path));
        }

        if let Ok(dir) = std::env::var("M2MP_FIRMWARE_DIR") {
            self.firmware_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn sample_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sample_retry_delay_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_some(&addr.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
