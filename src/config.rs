//! Configuration for the broker and endpoint roles.
//!
//! Settings come from an optional TOML file; every field has a default.
//! Command-line overrides are applied by the binary, not here.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }
}

/// Broker settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Port to listen on (all IPv4 interfaces)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections beyond this count are closed on accept
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Author stamped on lines fed by the hosting application
    #[serde(default = "default_server_author")]
    pub server_author: String,
    /// Readiness events fetched per wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_peers: default_max_peers(),
            server_author: default_server_author(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Broker address as `host:port`
    #[serde(default = "default_address")]
    pub address: String,
    /// Display name sent in the handshake
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            name: default_name(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    7777
}

fn default_max_peers() -> usize {
    1024
}

fn default_server_author() -> String {
    crate::protocol::SERVER_AUTHOR.to_string()
}

fn default_event_capacity() -> usize {
    64
}

fn default_address() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_name() -> String {
    "anonymous".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.broker.port, 7777);
        assert_eq!(config.broker.max_peers, 1024);
        assert_eq!(config.broker.server_author, "server");
        assert_eq!(config.endpoint.address, "127.0.0.1:7777");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [broker]
            port = 9000
            max_peers = 8
            server_author = "host"

            [endpoint]
            address = "chat.local:9000"
            name = "alice"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.port, 9000);
        assert_eq!(config.broker.max_peers, 8);
        assert_eq!(config.broker.server_author, "host");
        assert_eq!(config.broker.event_capacity, 64);
        assert_eq!(config.endpoint.address, "chat.local:9000");
        assert_eq!(config.endpoint.name, "alice");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoint]\nname = \"bob\"").unwrap();

        let config = TomlConfig::load(file.path()).unwrap();
        assert_eq!(config.endpoint.name, "bob");
        assert_eq!(config.broker.port, 7777);
    }

    #[test]
    fn test_load_errors() {
        let missing = TomlConfig::load(Path::new("/nonexistent/relay.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead(..))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker\nport = ").unwrap();
        let broken = TomlConfig::load(file.path());
        assert!(matches!(broken, Err(ConfigError::TomlParse(..))));
    }
}
