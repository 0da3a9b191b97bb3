//! Subscriptions service configuration
//!
//! Handles loading configuration from environment variables, TOML files, and CLI arguments.

use chrono::NaiveDate;
pub use playground_protocol::LogLevel;
use playground_protocol::{SubscriptionKey, UnknownLogLevel};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port number: {0}. Must be between 1 and 65535")]
    InvalidPort(u16),

    #[error(transparent)]
    InvalidLogLevel(#[from] UnknownLogLevel),

    #[error("Invalid server base URL: {0}")]
    InvalidServerUrl(String),

    #[error("Invalid subscription target: {0}")]
    InvalidTarget(String),

    #[error("Configuration file error: {0}")]
    FileError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Subscriptions service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host address of the management API
    pub host: String,
    /// Port of the management API
    pub port: u16,
    /// Log level
    pub log_level: LogLevel,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Base URL of the stream producer
    pub server_base_url: String,
    /// As-of date for new subscriptions; today when absent
    pub as_of_date: Option<NaiveDate>,
    /// Ask the producer to emulate fragmentation
    pub chunk: bool,
    /// Postgres connection string for the staging tables
    pub database_url: Option<String>,
    /// Subscriptions started by `start-all`
    pub targets: Vec<SubscriptionKey>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6067,
            log_level: LogLevel::Info,
            log_json: false,
            server_base_url: "http://localhost:6066".to_string(),
            as_of_date: None,
            chunk: true,
            database_url: None,
            targets: Vec::new(),
        }
    }
}

/// Parse a comma separated target list such as `accounts:ACC1,groups:EMEA`.
pub fn parse_targets(s: &str) -> Result<Vec<SubscriptionKey>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (entity_type, entity_name) = item
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidTarget(item.to_string()))?;
            SubscriptionKey::parse(entity_type, entity_name)
                .map_err(|e| ConfigError::InvalidTarget(format!("{}: {}", item, e)))
        })
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes")
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PLAYGROUND_HOST") {
            config.host = host;
        }

        if let Ok(port_str) = std::env::var("PLAYGROUND_PORT") {
            config.port = port_str
                .parse()
                .map_err(|_| ConfigError::EnvError(format!("PLAYGROUND_PORT={}", port_str)))?;
        }

        if let Ok(log_level) = std::env::var("PLAYGROUND_LOG_LEVEL") {
            config.log_level = LogLevel::from_str(&log_level)?;
        }

        if let Ok(json) = std::env::var("PLAYGROUND_LOG_JSON") {
            config.log_json = parse_bool(&json);
        }

        if let Ok(url) = std::env::var("PLAYGROUND_SERVER_BASE_URL") {
            config.server_base_url = url;
        }

        if let Ok(date) = std::env::var("PLAYGROUND_AS_OF_DATE") {
            config.as_of_date = Some(
                date.parse()
                    .map_err(|_| ConfigError::EnvError(format!("PLAYGROUND_AS_OF_DATE={}", date)))?,
            );
        }

        if let Ok(chunk) = std::env::var("PLAYGROUND_CHUNK") {
            config.chunk = parse_bool(&chunk);
        }

        if let Ok(url) = std::env::var("PLAYGROUND_DATABASE_URL") {
            config.database_url = Some(url);
        }

        if let Ok(targets) = std::env::var("PLAYGROUND_TARGETS") {
            config.targets = parse_targets(&targets)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileError(format!("Failed to read config file: {}", e)))?;

        let config: ClientConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::FileError(format!("Failed to parse TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        let url = reqwest::Url::parse(&self.server_base_url)
            .map_err(|e| ConfigError::InvalidServerUrl(format!("{}: {}", self.server_base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidServerUrl(format!(
                "{}: scheme must be http or https",
                self.server_base_url
            )));
        }

        Ok(())
    }

    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Merge with CLI arguments (CLI takes precedence)
    pub fn merge_with_cli(&mut self, cli: &CliArgs) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(log_level) = &cli.log_level {
            if let Ok(level) = LogLevel::from_str(log_level) {
                self.log_level = level;
            }
        }
        if let Some(url) = &cli.server_base_url {
            self.server_base_url = url.clone();
        }
        if let Some(date) = cli.as_of_date {
            self.as_of_date = Some(date);
        }
        if let Some(url) = &cli.database_url {
            self.database_url = Some(url.clone());
        }
    }
}

/// CLI arguments structure
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Config file path
    pub config_file: Option<PathBuf>,
    /// Host address override
    pub host: Option<String>,
    /// Port override
    pub port: Option<u16>,
    /// Log level override
    pub log_level: Option<String>,
    /// Producer base URL override
    pub server_base_url: Option<String>,
    /// As-of date override
    pub as_of_date: Option<NaiveDate>,
    /// Database URL override
    pub database_url: Option<String>,
}

/// Build configuration from all sources
///
/// Priority (highest to lowest):
/// 1. CLI arguments
/// 2. Environment variables
/// 3. Config file
/// 4. Default values
pub fn build_config(cli: &CliArgs) -> Result<ClientConfig, ConfigError> {
    let mut config = if let Some(config_path) = &cli.config_file {
        ClientConfig::from_file(config_path)?
    } else {
        ClientConfig::default()
    };

    if let Ok(env_config) = ClientConfig::from_env() {
        if std::env::var("PLAYGROUND_HOST").is_ok() {
            config.host = env_config.host;
        }
        if std::env::var("PLAYGROUND_PORT").is_ok() {
            config.port = env_config.port;
        }
        if std::env::var("PLAYGROUND_LOG_LEVEL").is_ok() {
            config.log_level = env_config.log_level;
        }
        if std::env::var("PLAYGROUND_LOG_JSON").is_ok() {
            config.log_json = env_config.log_json;
        }
        if std::env::var("PLAYGROUND_SERVER_BASE_URL").is_ok() {
            config.server_base_url = env_config.server_base_url;
        }
        if std::env::var("PLAYGROUND_AS_OF_DATE").is_ok() {
            config.as_of_date = env_config.as_of_date;
        }
        if std::env::var("PLAYGROUND_CHUNK").is_ok() {
            config.chunk = env_config.chunk;
        }
        if std::env::var("PLAYGROUND_DATABASE_URL").is_ok() {
            config.database_url = env_config.database_url;
        }
        if std::env::var("PLAYGROUND_TARGETS").is_ok() {
            config.targets = env_config.targets;
        }
    }

    config.merge_with_cli(cli);
    config.validate()?;

    Ok(config)
}
