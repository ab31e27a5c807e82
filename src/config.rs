//! # Configuration Management
//!
//! Centralized configuration for bus connections.
//!
//! This module provides structured configuration for the client connection,
//! the framing layer, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Defaults
//! - Method calls time out after 25 seconds
//! - Authentication must finish within 10 seconds
//! - Messages are capped at the protocol maximum of 128 MiB

use crate::core::marshal::Endian;
use crate::core::message::MAX_MESSAGE_SIZE;
use crate::error::{BusError, Result};
use crate::protocol::handshake::AuthMechanism;
use crate::transport::address::BusAddress;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BusConfig {
    /// Client connection configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport and framing configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BusConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| BusError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| BusError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| BusError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BUS_PROTOCOL_ADDRESS") {
            config.client.address = Some(addr);
        }

        if let Ok(mechanism) = std::env::var("BUS_PROTOCOL_AUTH_MECHANISM") {
            config.client.auth_mechanism = match mechanism.to_ascii_lowercase().as_str() {
                "external" => AuthMechanism::External,
                "anonymous" => AuthMechanism::Anonymous,
                other => {
                    return Err(BusError::ConfigError(format!(
                        "Unknown auth mechanism: {other}"
                    )))
                }
            };
        }

        if let Ok(timeout) = std::env::var("BUS_PROTOCOL_CALL_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.call_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("BUS_PROTOCOL_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("BUS_PROTOCOL_MAX_MESSAGE_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.transport.max_message_size = val;
            }
        }

        Ok(config)
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

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BusError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| BusError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BusError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Client connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bus address (e.g. "unix:path=/run/user/1000/bus"); the session bus when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// SASL mechanism used during the handshake
    pub auth_mechanism: AuthMechanism,

    /// Time allowed for connecting and authenticating
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Default time to wait for a method reply
    #[serde(with = "duration_serde")]
    pub call_timeout: Duration,

    /// How often expired pending calls are swept
    #[serde(with = "duration_serde")]
    pub pending_sweep_interval: Duration,

    /// Send `org.freedesktop.DBus.Hello` after connecting to a bus
    pub auto_hello: bool,

    /// Answer method calls nobody handles with `UnknownMethod` instead of ignoring them
    pub reply_unknown_methods: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: None,
            auth_mechanism: AuthMechanism::default(),
            connection_timeout: timeout::DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: timeout::DEFAULT_CALL_TIMEOUT,
            pending_sweep_interval: timeout::PENDING_SWEEP_INTERVAL,
            auto_hello: true,
            reply_unknown_methods: false,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(address) = &self.address {
            if let Err(e) = BusAddress::parse_list(address) {
                errors.push(format!("Invalid bus address '{address}': {e}"));
            }
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.call_timeout.as_millis() < 10 {
            errors.push("Call timeout too short (minimum: 10ms)".to_string());
        } else if self.call_timeout.as_secs() > 3600 {
            errors.push("Call timeout too long (maximum: 1 hour)".to_string());
        }

        if self.pending_sweep_interval.as_millis() < 10 {
            errors.push("Pending sweep interval too short (minimum: 10ms)".to_string());
        } else if self.pending_sweep_interval > self.call_timeout {
            errors.push("Pending sweep interval cannot exceed the call timeout".to_string());
        }

        errors
    }
}

/// Transport and framing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame accepted or sent, in bytes
    pub max_message_size: usize,

    /// Byte order used for outgoing messages
    pub byte_order: Endian,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            byte_order: Endian::default(),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size < 4096 {
            errors.push("Max message size too small (minimum: 4 KB)".to_string());
        } else if self.max_message_size > MAX_MESSAGE_SIZE {
            errors.push(format!(
                "Max message size too large: {} bytes (protocol maximum: {} bytes)",
                self.max_message_size, MAX_MESSAGE_SIZE
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            json_format: false,
        }
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
        level.as_str().to_lowercase().serialize(serializer)
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
