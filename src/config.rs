//! Configuration module for the pipe-cache server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Well-known channel name shared by server and client
pub const DEFAULT_PIPE_NAME: &str = "KeyValuePipe";

/// Largest message carried by the transport
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Command-line arguments for the cache server
#[derive(Parser, Debug, Default)]
#[command(name = "pipe-cache")]
#[command(version)]
#[command(about = "A key-value cache server over a local named pipe", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Channel name (a pipe name on Windows, a socket name or path on Unix)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of simultaneous connections (unbounded if unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Channel name
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Connection admission limit
    pub max_connections: Option<usize>,
    /// Idle timeout in seconds
    pub idle_timeout: Option<u64>,
    /// Largest request read in one message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Delay before retrying a failed endpoint, in milliseconds
    #[serde(default = "default_create_backoff_ms")]
    pub create_backoff_ms: u64,
    /// Give up after this many consecutive endpoint failures
    pub max_consecutive_failures: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: None,
            max_connections: None,
            idle_timeout: None,
            max_message_size: default_max_message_size(),
            create_backoff_ms: default_create_backoff_ms(),
            max_consecutive_failures: None,
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

fn default_name() -> String {
    DEFAULT_PIPE_NAME.to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_create_backoff_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub name: String,
    pub workers: Option<usize>,
    pub max_connections: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub max_message_size: usize,
    pub create_backoff: Duration,
    pub max_consecutive_failures: Option<u32>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;

        Config {
            name: cli.name.unwrap_or(server.name),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.or(server.max_connections),
            idle_timeout: cli
                .idle_timeout
                .or(server.idle_timeout)
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            max_message_size: server.max_message_size.max(1),
            create_backoff: Duration::from_millis(server.create_backoff_ms),
            max_consecutive_failures: server.max_consecutive_failures,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "KeyValuePipe");
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.create_backoff, Duration::from_secs(1));
        assert_eq!(config.max_connections, None);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.max_consecutive_failures, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            name = "OtherPipe"
            workers = 4
            max_connections = 64
            idle_timeout = 30
            max_message_size = 8192
            create_backoff_ms = 250
            max_consecutive_failures = 10

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(CliArgs::default(), toml_config);
        assert_eq!(config.name, "OtherPipe");
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.max_connections, Some(64));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_message_size, 8192);
        assert_eq!(config.create_backoff, Duration::from_millis(250));
        assert_eq!(config.max_consecutive_failures, Some(10));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            name = "FromFile"
            idle_timeout = 30

            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let cli = CliArgs {
            name: Some("FromCli".to_string()),
            idle_timeout: Some(0),
            log_level: Some("warn".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.name, "FromCli");
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::parse_from([
            "pipe-cache",
            "--name",
            "TestPipe",
            "--max-connections",
            "8",
            "--log-level",
            "trace",
        ]);
        assert_eq!(cli.name.as_deref(), Some("TestPipe"));
        assert_eq!(cli.max_connections, Some(8));
        assert_eq!(cli.log_level.as_deref(), Some("trace"));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/pipe-cache.toml")),
            ..CliArgs::default()
        };

        match Config::from_args(cli) {
            Err(ConfigError::FileRead(path, _)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/pipe-cache.toml"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
