//! Configuration module for the ack-loop server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "ack-loop")]
#[command(author = "ack-loop authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-based TCP server that acknowledges every request", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Reply sent for every request
    #[arg(short, long)]
    pub response: Option<String>,

    /// Per-connection buffer capacity in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Reply configuration
#[derive(Debug, Deserialize)]
pub struct ResponseConfig {
    /// Bytes written back after every read
    #[serde(default = "default_response")]
    pub payload: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            payload: default_response(),
        }
    }
}

/// Event loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of each connection's read and write buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum events handled per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Readiness wait timeout in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            poll_timeout_secs: default_poll_timeout(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_response() -> String {
    "success".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_poll_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub response: String,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["ack-loop"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            response: cli.response.unwrap_or(toml_config.response.payload),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.runtime.buffer_size),
            batch_size: toml_config.runtime.batch_size,
            poll_timeout: Duration::from_secs(toml_config.runtime.poll_timeout_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the event loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "host '{}' is not an IP address",
                self.host
            )));
        }
        if self.response.is_empty() {
            return Err(ConfigError::Invalid("response must not be empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.response, "success");
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.poll_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9100

            [response]
            payload = "ok"

            [runtime]
            buffer_size = 4096
            poll_timeout_secs = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.response.payload, "ok");
        assert_eq!(config.runtime.buffer_size, 4096);
        assert_eq!(config.runtime.batch_size, 1024);
        assert_eq!(config.runtime.poll_timeout_secs, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from(["ack-loop", "--port", "9200", "-r", "ack"]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9100
            host = "127.0.0.1"

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 9200);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.response, "ack");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.response.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.host = "not-an-ip".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.poll_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
