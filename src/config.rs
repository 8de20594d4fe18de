//! Configuration for the command-line driver.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// Command-line arguments for the respin driver
#[derive(Parser, Debug)]
#[command(name = "respin")]
#[command(version = "0.1.0")]
#[command(about = "Send a command to a RESP server through the failover client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Master endpoint (host:port)
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Replica endpoint (host:port); may be given multiple times
    #[arg(short = 'r', long = "replica")]
    pub replicas: Vec<String>,

    /// Number of descriptor slots in the event loop
    #[arg(long)]
    pub setsize: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Command to send (defaults to PING)
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Master endpoint
    #[serde(default = "default_server")]
    pub server: String,
    /// Replica endpoints
    #[serde(default)]
    pub replicas: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            replicas: Vec::new(),
        }
    }
}

/// Event-loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Number of descriptor slots
    #[serde(default = "default_setsize")]
    pub setsize: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            setsize: default_setsize(),
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

fn default_server() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_setsize() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub replicas: Vec<String>,
    pub setsize: usize,
    pub log_level: String,
    pub command: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::merge(CliArgs::parse())
    }

    fn merge(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            server: cli.server.unwrap_or(toml_config.connection.server),
            replicas: if cli.replicas.is_empty() {
                toml_config.connection.replicas
            } else {
                cli.replicas
            },
            setsize: cli.setsize.unwrap_or(toml_config.runtime.setsize),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            command: if cli.command.is_empty() {
                vec!["PING".to_string()]
            } else {
                cli.command
            },
        })
    }
}

/// Split a `host:port` endpoint string.
pub fn split_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Endpoint(endpoint.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| ConfigError::Endpoint(endpoint.to_string()))?;
    Ok((host.to_string(), port))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file {0:?}: {1}")]
    TomlParse(PathBuf, toml::de::Error),
    #[error("invalid endpoint '{0}' (expected host:port)")]
    Endpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = TomlConfig::default();
        assert_eq!(config.connection.server, "127.0.0.1:6379");
        assert!(config.connection.replicas.is_empty());
        assert_eq!(config.runtime.setsize, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
            [connection]
            server = "10.0.0.1:6379"
            replicas = ["10.0.0.2:6379", "10.0.0.3:6379"]

            [runtime]
            setsize = 8

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.server, "10.0.0.1:6379");
        assert_eq!(config.connection.replicas.len(), 2);
        assert_eq!(config.runtime.setsize, 8);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn cli_overrides_defaults() {
        let cli = CliArgs {
            config: None,
            server: Some("10.1.1.1:7000".to_string()),
            replicas: vec!["10.1.1.2:7000".to_string()],
            setsize: Some(4),
            log_level: "info".to_string(),
            command: vec!["GET".to_string(), "key".to_string()],
        };
        let config = Config::merge(cli).unwrap();
        assert_eq!(config.server, "10.1.1.1:7000");
        assert_eq!(config.replicas, vec!["10.1.1.2:7000".to_string()]);
        assert_eq!(config.setsize, 4);
        assert_eq!(config.command, vec!["GET".to_string(), "key".to_string()]);
    }

    #[test]
    fn endpoints_split_on_the_last_colon() {
        assert_eq!(
            split_endpoint("127.0.0.1:6379").unwrap(),
            ("127.0.0.1".to_string(), 6379)
        );
        assert!(split_endpoint("no-port").is_err());
        assert!(split_endpoint("host:notanumber").is_err());
    }
}
