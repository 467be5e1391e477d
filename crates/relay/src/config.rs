//! Configuration management for the chat relay.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/chat-relay/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_address must not be empty")]
    EmptyBindAddress,

    #[error("max_file_size must be between 1 and 4294967295, got {0}")]
    InvalidMaxFileSize(u64),

    #[error("outbound_queue must be between 1 and 65536, got {0}")]
    InvalidOutboundQueue(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted per-session outbound queue.
const MAX_OUTBOUND_QUEUE: usize = 65536;

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 12345;

/// Main configuration structure for the chat relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// File store configuration.
    pub store: StoreConfig,

    /// Per-session configuration.
    pub session: SessionConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    pub bind_address: String,

    /// TCP port. 0 picks an ephemeral port.
    pub port: u16,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// File store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding uploaded files. Wiped at startup.
    pub root: PathBuf,

    /// Maximum size of one uploaded file in bytes (default: 100MB).
    pub max_file_size: u64,
}

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of each session's outbound frame queue.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("server_files"),
            max_file_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-relay")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - RELAY_PORT: Override the listen port
    /// - RELAY_STORE_DIR: Override the file store directory
    /// - RELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("RELAY_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.server.port = port;
                    }
                    Err(e) => {
                        tracing::warn!(value = %port, error = %e, "Ignoring invalid RELAY_PORT");
                    }
                }
            }
        }

        if let Ok(dir) = std::env::var("RELAY_STORE_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding store root from environment: {}", dir);
                self.store.root = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }

        // Sizes travel as u32 on the wire
        if self.store.max_file_size == 0 || self.store.max_file_size > u64::from(u32::MAX) {
            return Err(ConfigError::InvalidMaxFileSize(self.store.max_file_size));
        }

        if self.session.outbound_queue < 1 || self.session.outbound_queue > MAX_OUTBOUND_QUEUE {
            return Err(ConfigError::InvalidOutboundQueue(self.session.outbound_queue));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("RELAY_PORT");
        std::env::remove_var("RELAY_STORE_DIR");
        std::env::remove_var("RELAY_LOG_LEVEL");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.store.root, PathBuf::from("server_files"));
        assert_eq!(config.store.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.session.outbound_queue, 256);
    }

    #[test]
    fn test_listen_address() {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        assert_eq!(config.listen_address(), "127.0.0.1:0");
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
port = 4000

[session]
outbound_queue = 8
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.session.outbound_queue, 8);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
bind_address = "127.0.0.1"
port = 9000
log_level = "trace"

[store]
root = "/var/lib/chat-relay"
max_file_size = 1048576

[session]
outbound_queue = 32
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.store.root, PathBuf::from("/var/lib/chat-relay"));
        assert_eq!(config.store.max_file_size, 1048576);
        assert_eq!(config.session.outbound_queue, 32);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
port = 1
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[server]
port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());

        let toml = r#"
[server]
port = 70000
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.server.log_level = "warn".to_string();
        original.store.root = PathBuf::from("/tmp/files");
        original.session.outbound_queue = 42;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[store]"));
        assert!(toml.contains("[session]"));

        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.server.port = 2222;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("chat-relay"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_port_and_store() {
        clear_env();
        std::env::set_var("RELAY_PORT", "4321");
        std::env::set_var("RELAY_STORE_DIR", "/tmp/relay-files");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.port, 4321);
        assert_eq!(config.store.root, PathBuf::from("/tmp/relay-files"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        clear_env();
        std::env::set_var("RELAY_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.port, DEFAULT_PORT);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("RELAY_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("RELAY_LOG_LEVEL", "");
        std::env::set_var("RELAY_STORE_DIR", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_bind_address() {
        let mut config = Config::default();
        config.server.bind_address = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyBindAddress));
    }

    #[test]
    fn test_validate_max_file_size() {
        let mut config = Config::default();
        config.store.max_file_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFileSize(0)));

        config.store.max_file_size = u64::from(u32::MAX) + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxFileSize(_))
        ));

        config.store.max_file_size = u64::from(u32::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_outbound_queue_bounds() {
        let mut config = Config::default();

        config.session.outbound_queue = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidOutboundQueue(0)));

        config.session.outbound_queue = 65537;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidOutboundQueue(65537))
        );

        config.session.outbound_queue = 1;
        assert!(config.validate().is_ok());

        config.session.outbound_queue = 65536;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.server.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.server.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
