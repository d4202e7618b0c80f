use std::env;
use std::fmt;

use crate::errors::BridgeError;

/// Output format for bridge log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.to_ascii_lowercase().as_str() {
            "text" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        };
        f.write_str(text)
    }
}

/// Logging verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.to_ascii_lowercase().as_str() {
            "error" | "err" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" | "verbose" => Some(Self::Trace),
            _ => None,
        }
    }

    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(text)
    }
}

/// User-specified or environment-provided log configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Warn,
            format: LogFormat::Text,
        }
    }
}

impl LogConfig {
    /// Read `GUESTLINK_LOG` and `GUESTLINK_LOG_FORMAT`, falling back to
    /// the defaults for unset or unparseable values.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = LogConfig::default();
        if let Ok(spec) = env::var("GUESTLINK_LOG") {
            if let Some(level) = LogLevel::parse(&spec) {
                config.level = level;
            }
        }
        if let Ok(spec) = env::var("GUESTLINK_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&spec) {
                config.format = format;
            }
        }
        config
    }
}

/// Install the global `tracing` subscriber for bridge diagnostics.
/// Fails if a subscriber is already installed.
pub fn init(config: LogConfig) -> Result<(), BridgeError> {
    let level = config.level.as_tracing_level();
    let outcome = match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    outcome.map_err(|err| BridgeError {
        message: format!("failed to install log subscriber: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_variants() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), Some(LogLevel::Trace));
        assert!(LogLevel::parse("loud").is_none());
    }

    #[test]
    fn parse_format_variants() {
        assert_eq!(LogFormat::parse("plain"), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert!(LogFormat::parse("xml").is_none());
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(
            LogLevel::parse(&LogLevel::Debug.to_string()),
            Some(LogLevel::Debug)
        );
        assert_eq!(
            LogFormat::parse(&LogFormat::Json.to_string()),
            Some(LogFormat::Json)
        );
    }
}
