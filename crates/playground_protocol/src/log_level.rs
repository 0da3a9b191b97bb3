//! Log verbosity shared by both service configurations.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// A log level name outside `trace`, `debug`, `info`, `warn`, `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
pub struct UnknownLogLevel(pub String);

/// Log levels accepted in configuration files, env vars and CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    /// Everything, including per-frame detail
    Trace,
    /// Diagnostic detail
    Debug,
    /// Lifecycle events
    #[default]
    Info,
    /// Recoverable anomalies
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    /// Directive for a `tracing` env filter.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(UnknownLogLevel(s.to_string())),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = UnknownLogLevel;

    fn try_from(s: String) -> Result<Self, <LogLevel as TryFrom<String>>::Error> {
        s.parse()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("DEBUG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str(" warn ").unwrap(), LogLevel::Warn);
        assert_eq!(
            LogLevel::from_str("verbose"),
            Err(UnknownLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_log_level_display_round_trips() {
        for level in [LogLevel::Trace, LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_log_level_deserializes_case_insensitively() {
        let level: LogLevel = serde_json::from_str(r#""Error""#).unwrap();
        assert_eq!(level, LogLevel::Error);
        assert!(serde_json::from_str::<LogLevel>(r#""loud""#).is_err());
    }
}
