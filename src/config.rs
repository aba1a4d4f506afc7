//! # Configuration Management
//!
//! Centralized configuration for the world-server protocol core.
//!
//! ## Configuration Sources
//! - TOML strings and files via [`NetworkConfig::from_toml`] / [`NetworkConfig::from_file`]
//! - `REALM_WIRE_*` environment variables via [`NetworkConfig::from_env`]
//! - A flat key -> value map with dotted keys via [`NetworkConfig::from_key_values`]
//! - Direct instantiation with defaults
//!
//! Durations are expressed in milliseconds in every source.

use crate::error::{ProtocolError, Result};
use crate::utils::compression::CompressionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Prefix of every environment variable read by [`NetworkConfig::from_env`].
pub const ENV_PREFIX: &str = "REALM_WIRE_";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Listener and lifecycle configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Framing and compression configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Per-session queueing, keep-alive and clock sync
    #[serde(default)]
    pub session: SessionConfig,

    /// Realm identity and auth policy
    #[serde(default)]
    pub realm: RealmConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// `REALM_WIRE_TRANSPORT__COMPRESSION_THRESHOLD_BYTES=200` sets
    /// `transport.compression_threshold_bytes`; the double underscore separates
    /// section and key.
    pub fn from_env() -> Result<Self> {
        let pairs = std::env::vars().filter_map(|(name, value)| {
            let rest = name.strip_prefix(ENV_PREFIX)?;
            let (section, key) = rest.split_once("__")?;
            Some((
                format!("{}.{}", section.to_ascii_lowercase(), key.to_ascii_lowercase()),
                value,
            ))
        });

        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(&key, &value)?;
        }
        Ok(config)
    }

    /// Build a configuration from a flat key -> value map.
    ///
    /// Keys are `section.field`. Unknown keys and unparsable values are
    /// reported as [`ProtocolError::ConfigError`].
    pub fn from_key_values<K, V>(values: &HashMap<K, V>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in values {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Set one dotted key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let (section, field) = key
            .split_once('.')
            .ok_or_else(|| ProtocolError::ConfigError(format!("Key '{key}' has no section")))?;

        match section {
            "server" => self.server.set(field, value),
            "transport" => self.transport.set(field, value),
            "session" => self.session.set(field, value),
            "realm" => self.realm.set(field, value),
            "logging" => self.logging.set(field, value),
            _ => Err(unknown_key(key)),
        }
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.session.validate());
        errors.extend(self.realm.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn unknown_key(key: &str) -> ProtocolError {
    ProtocolError::ConfigError(format!("Unknown configuration key '{key}'"))
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        ProtocolError::ConfigError(format!("Invalid value '{value}' for key '{key}'"))
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_value::<u64>(key, value).map(Duration::from_millis)
}

/// Listener and lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8085")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Time a client gets to complete the auth handshake
    #[serde(with = "duration_serde")]
    pub auth_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Period of the world update loop
    #[serde(with = "duration_serde")]
    pub world_update_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:8085"),
            max_connections: 5000,
            auth_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            world_update_interval: Duration::from_millis(50),
        }
    }
}

impl ServerConfig {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        let key = format!("server.{field}");
        match field {
            "address" => self.address = value.trim().to_string(),
            "max_connections" => self.max_connections = parse_value(&key, value)?,
            "auth_timeout" => self.auth_timeout = parse_millis(&key, value)?,
            "shutdown_timeout" => self.shutdown_timeout = parse_millis(&key, value)?,
            "world_update_interval" => self.world_update_interval = parse_millis(&key, value)?,
            _ => return Err(unknown_key(&key)),
        }
        Ok(())
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8085')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.auth_timeout.as_millis() < 100 {
            errors.push("Auth timeout too short (minimum: 100ms)".to_string());
        } else if self.auth_timeout.as_secs() > 300 {
            errors.push("Auth timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.world_update_interval.is_zero() {
            errors.push("World update interval must be greater than 0".to_string());
        } else if self.world_update_interval.as_secs() > 1 {
            errors.push("World update interval too long (maximum: 1s)".to_string());
        }

        errors
    }
}

/// Framing and compression configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound of the client header size field, opcode included
    pub max_client_packet_size: usize,

    /// zlib level for outbound update packets
    pub compression_level: u32,

    /// Update payloads strictly larger than this are compressed
    pub compression_threshold_bytes: usize,

    /// Initial preferred send buffer size; grows up to 64 KiB
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_client_packet_size: crate::core::header::MAX_CLIENT_PACKET_SIZE,
            compression_level: 1,
            compression_threshold_bytes: 100,
            send_buffer_size: 4096,
        }
    }
}

impl TransportConfig {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        let key = format!("transport.{field}");
        match field {
            "max_client_packet_size" => self.max_client_packet_size = parse_value(&key, value)?,
            "compression_level" => self.compression_level = parse_value(&key, value)?,
            "compression_threshold_bytes" => {
                self.compression_threshold_bytes = parse_value(&key, value)?
            }
            "send_buffer_size" => self.send_buffer_size = parse_value(&key, value)?,
            _ => return Err(unknown_key(&key)),
        }
        Ok(())
    }

    /// Compression policy described by this section.
    pub fn compression_policy(&self) -> CompressionPolicy {
        CompressionPolicy::new(self.compression_threshold_bytes, self.compression_level)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_client_packet_size < 4 {
            errors.push("Max client packet size must cover the opcode (minimum: 4)".to_string());
        } else if self.max_client_packet_size > usize::from(u16::MAX) {
            errors.push(format!(
                "Max client packet size too large: {} (maximum: 65535)",
                self.max_client_packet_size
            ));
        }

        if !(1..=9).contains(&self.compression_level) {
            errors.push(format!(
                "Invalid compression level: {} (valid range: 1-9)",
                self.compression_level
            ));
        }

        if self.send_buffer_size == 0 {
            errors.push("Send buffer size must be greater than 0".to_string());
        } else if self.send_buffer_size > 65536 {
            errors.push("Send buffer size too large (maximum: 65536)".to_string());
        }

        errors
    }
}

/// Per-session queueing, keep-alive and clock sync
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inbound packets a session may buffer before it is considered stalled
    pub inbound_queue_limit: usize,

    /// Outbound packets buffered per connection
    pub outbound_queue_limit: usize,

    /// Packets processed per session per update pass
    pub max_packets_per_update: usize,

    /// Session is kicked after this long without client traffic
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Pings closer together than this count as overspeed
    #[serde(with = "duration_serde")]
    pub ping_min_interval: Duration,

    /// Consecutive overspeed pings tolerated; 0 disables the check
    pub max_overspeed_pings: u32,

    /// Period between time-sync probes
    #[serde(with = "duration_serde")]
    pub time_sync_interval: Duration,

    /// Delay of the second time-sync probe after entering the world
    #[serde(with = "duration_serde")]
    pub time_sync_first_interval: Duration,

    /// Number of (delta, round trip) samples kept
    pub clock_sample_window: usize,

    /// Minimum change before a new clock delta is adopted
    pub clock_delta_hysteresis_ms: i64,

    /// What happens when a client exceeds a handler's per-second limit
    pub flood_policy: FloodPolicy,
}

/// Reaction to a client flooding a rate-limited opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FloodPolicy {
    /// Log and keep processing
    Log,
    /// Drop the packet and close the session
    Kick,
}

impl std::str::FromStr for FloodPolicy {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "kick" => Ok(Self::Kick),
            _ => Err(()),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbound_queue_limit: 1024,
            outbound_queue_limit: 1024,
            max_packets_per_update: 150,
            idle_timeout: Duration::from_secs(900),
            ping_min_interval: Duration::from_secs(27),
            max_overspeed_pings: 2,
            time_sync_interval: Duration::from_secs(10),
            time_sync_first_interval: Duration::from_secs(5),
            clock_sample_window: 6,
            clock_delta_hysteresis_ms: 25,
            flood_policy: FloodPolicy::Kick,
        }
    }
}

impl SessionConfig {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        let key = format!("session.{field}");
        match field {
            "inbound_queue_limit" => self.inbound_queue_limit = parse_value(&key, value)?,
            "outbound_queue_limit" => self.outbound_queue_limit = parse_value(&key, value)?,
            "max_packets_per_update" => self.max_packets_per_update = parse_value(&key, value)?,
            "idle_timeout" => self.idle_timeout = parse_millis(&key, value)?,
            "ping_min_interval" => self.ping_min_interval = parse_millis(&key, value)?,
            "max_overspeed_pings" => self.max_overspeed_pings = parse_value(&key, value)?,
            "time_sync_interval" => self.time_sync_interval = parse_millis(&key, value)?,
            "time_sync_first_interval" => {
                self.time_sync_first_interval = parse_millis(&key, value)?
            }
            "clock_sample_window" => self.clock_sample_window = parse_value(&key, value)?,
            "clock_delta_hysteresis_ms" => {
                self.clock_delta_hysteresis_ms = parse_value(&key, value)?
            }
            "flood_policy" => self.flood_policy = parse_value(&key, value)?,
            _ => return Err(unknown_key(&key)),
        }
        Ok(())
    }

    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.inbound_queue_limit == 0 {
            errors.push("Inbound queue limit must be greater than 0".to_string());
        }

        if self.outbound_queue_limit == 0 {
            errors.push("Outbound queue limit must be greater than 0".to_string());
        }

        if self.max_packets_per_update == 0 {
            errors.push("Max packets per update must be greater than 0".to_string());
        }

        if self.idle_timeout.as_secs() < 1 {
            errors.push("Idle timeout too short (minimum: 1s)".to_string());
        }

        if self.time_sync_interval.as_millis() < 100 {
            errors.push("Time sync interval too short (minimum: 100ms)".to_string());
        }

        if self.time_sync_first_interval.as_millis() < 100 {
            errors.push("First time sync interval too short (minimum: 100ms)".to_string());
        }

        if self.clock_sample_window == 0 {
            errors.push("Clock sample window must hold at least one sample".to_string());
        } else if self.clock_sample_window > 64 {
            errors.push(format!(
                "Clock sample window too large: {} (maximum: 64)",
                self.clock_sample_window
            ));
        }

        if self.clock_delta_hysteresis_ms < 0 {
            errors.push("Clock delta hysteresis cannot be negative".to_string());
        }

        errors
    }
}

/// Realm identity and auth policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RealmConfig {
    /// Realm id clients must present in AUTH_SESSION
    pub realm_id: u32,

    /// Minimum account security level; 0 admits players
    pub player_security_limit: u8,

    /// Whether the anti-cheat module is mandatory
    pub anticheat_enabled: bool,

    /// Highest expansion served by this realm
    pub expansion: u8,

    /// Record real client addresses in the account store
    pub log_ip_addresses: bool,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            realm_id: 1,
            player_security_limit: 0,
            anticheat_enabled: false,
            expansion: 2,
            log_ip_addresses: true,
        }
    }
}

impl RealmConfig {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        let key = format!("realm.{field}");
        match field {
            "realm_id" => self.realm_id = parse_value(&key, value)?,
            "player_security_limit" => self.player_security_limit = parse_value(&key, value)?,
            "anticheat_enabled" => self.anticheat_enabled = parse_value(&key, value)?,
            "expansion" => self.expansion = parse_value(&key, value)?,
            "log_ip_addresses" => self.log_ip_addresses = parse_value(&key, value)?,
            _ => return Err(unknown_key(&key)),
        }
        Ok(())
    }

    /// Validate realm configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.realm_id == 0 {
            errors.push("Realm id must be greater than 0".to_string());
        }

        if self.expansion > 2 {
            errors.push(format!(
                "Unsupported expansion: {} (valid range: 0-2)",
                self.expansion
            ));
        }

        if self.player_security_limit > 3 {
            errors.push(format!(
                "Player security limit too high: {} (maximum: 3)",
                self.player_security_limit
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("realm-wire"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    fn set(&mut self, field: &str, value: &str) -> Result<()> {
        let key = format!("logging.{field}");
        match field {
            "app_name" => self.app_name = value.trim().to_string(),
            "log_level" => self.log_level = parse_value(&key, value)?,
            "json_format" => self.json_format = parse_value(&key, value)?,
            _ => return Err(unknown_key(&key)),
        }
        Ok(())
    }

    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
