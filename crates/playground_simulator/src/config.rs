//! Simulator configuration management
//!
//! Handles loading configuration from environment variables, TOML files, and CLI arguments.

pub use playground_protocol::LogLevel;
use playground_protocol::UnknownLogLevel;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port number: {0}. Must be between 1 and 65535")]
    InvalidPort(u16),

    #[error(transparent)]
    InvalidLogLevel(#[from] UnknownLogLevel),

    #[error("Invalid stream setting: {0}")]
    InvalidStream(String),

    #[error("Configuration file error: {0}")]
    FileError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Pacing of the emitted stream.
///
/// Defaults are deliberately slow so a developer can watch a stream by eye;
/// tests shrink them to a few milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamTiming {
    /// Heartbeats emitted after a non-empty snapshot
    pub snapshot_end_heartbeats: u32,
    /// Pause after each end-of-snapshot heartbeat
    pub snapshot_end_delay_ms: u64,
    /// Pause after a heartbeat sent because nothing changed
    pub idle_heartbeat_interval_ms: u64,
    /// Pause after a batch of increments
    pub increment_poll_interval_ms: u64,
    /// Pause between the two halves of a fragmented frame
    pub fragment_delay_ms: u64,
    /// Probability that an eligible frame is fragmented when `chunk=true`
    pub fragment_probability: f64,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            snapshot_end_heartbeats: 5,
            snapshot_end_delay_ms: 1_000,
            idle_heartbeat_interval_ms: 10_000,
            increment_poll_interval_ms: 5_000,
            fragment_delay_ms: 25,
            fragment_probability: 0.3,
        }
    }
}

impl StreamTiming {
    pub fn snapshot_end_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_end_delay_ms)
    }

    pub fn idle_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.idle_heartbeat_interval_ms)
    }

    pub fn increment_poll_interval(&self) -> Duration {
        Duration::from_millis(self.increment_poll_interval_ms)
    }

    pub fn fragment_delay(&self) -> Duration {
        Duration::from_millis(self.fragment_delay_ms)
    }

    /// Validate the stream timing
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fragment_probability) {
            return Err(ConfigError::InvalidStream(format!(
                "fragment_probability {} must be within [0, 1]",
                self.fragment_probability
            )));
        }
        if self.snapshot_end_heartbeats == 0 {
            return Err(ConfigError::InvalidStream(
                "snapshot_end_heartbeats must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Simulator configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Log level
    pub log_level: LogLevel,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Postgres connection string for the change table
    pub database_url: Option<String>,
    /// JSON seed file for the in-memory change table (used without a database)
    pub seed_file: Option<PathBuf>,
    /// Stream pacing
    pub stream: StreamTiming,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6066,
            log_level: LogLevel::Info,
            log_json: false,
            database_url: None,
            seed_file: None,
            stream: StreamTiming::default(),
        }
    }
}

impl SimulatorConfig {
    /// Create a new SimulatorConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("SIMULATOR_HOST") {
            config.host = host;
        }

        if let Ok(port_str) = std::env::var("SIMULATOR_PORT") {
            config.port = port_str
                .parse()
                .map_err(|_| ConfigError::EnvError(format!("SIMULATOR_PORT={}", port_str)))?;
        }

        if let Ok(log_level) = std::env::var("SIMULATOR_LOG_LEVEL") {
            config.log_level = LogLevel::from_str(&log_level)?;
        }

        if let Ok(json) = std::env::var("SIMULATOR_LOG_JSON") {
            config.log_json = json.to_lowercase() == "true";
        }

        if let Ok(url) = std::env::var("SIMULATOR_DATABASE_URL") {
            config.database_url = Some(url);
        }

        if let Ok(path) = std::env::var("SIMULATOR_SEED_FILE") {
            config.seed_file = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileError(format!("Failed to read config file: {}", e)))?;

        let config: SimulatorConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::FileError(format!("Failed to parse TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        self.stream.validate()
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
        if let Some(url) = &cli.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(seed) = &cli.seed_file {
            self.seed_file = Some(seed.clone());
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
    /// Database URL override
    pub database_url: Option<String>,
    /// Seed file override
    pub seed_file: Option<PathBuf>,
}

/// Build configuration from all sources
///
/// Priority (highest to lowest):
/// 1. CLI arguments
/// 2. Environment variables
/// 3. Config file
/// 4. Default values
pub fn build_config(cli: &CliArgs) -> Result<SimulatorConfig, ConfigError> {
    let mut config = if let Some(config_path) = &cli.config_file {
        SimulatorConfig::from_file(config_path)?
    } else {
        SimulatorConfig::default()
    };

    if let Ok(env_config) = SimulatorConfig::from_env() {
        if std::env::var("SIMULATOR_HOST").is_ok() {
            config.host = env_config.host;
        }
        if std::env::var("SIMULATOR_PORT").is_ok() {
            config.port = env_config.port;
        }
        if std::env::var("SIMULATOR_LOG_LEVEL").is_ok() {
            config.log_level = env_config.log_level;
        }
        if std::env::var("SIMULATOR_LOG_JSON").is_ok() {
            config.log_json = env_config.log_json;
        }
        if std::env::var("SIMULATOR_DATABASE_URL").is_ok() {
            config.database_url = env_config.database_url;
        }
        if std::env::var("SIMULATOR_SEED_FILE").is_ok() {
            config.seed_file = env_config.seed_file;
        }
    }

    config.merge_with_cli(cli);
    config.validate()?;

    Ok(config)
}
