//! Logging Configuration
//!
//! Loaded from environment variables (`GCS_SINK_LOG_*`). `RUST_LOG`, when
//! set, takes precedence over the configured level.

use std::fmt;
use std::str::FromStr;

pub const LOG_FORMAT_VAR: &str = "GCS_SINK_LOG_FORMAT";
pub const LOG_LEVEL_VAR: &str = "GCS_SINK_LOG_LEVEL";

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Default filter directive, e.g. `info` or `gcs_sink=debug`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    ///
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = LogConfig::default();
        LogConfig {
            format: lookup(LOG_FORMAT_VAR)
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            level: lookup(LOG_LEVEL_VAR)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_json_and_level() {
        let config = LogConfig::from_lookup(lookup(&[
            (LOG_FORMAT_VAR, "JSON"),
            (LOG_LEVEL_VAR, "gcs_sink=debug"),
        ]));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "gcs_sink=debug");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = LogConfig::from_lookup(lookup(&[
            (LOG_FORMAT_VAR, "xml"),
            (LOG_LEVEL_VAR, "  "),
        ]));
        assert_eq!(config, LogConfig::default());
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
