//! Sink Configuration
//!
//! Settings are loaded from TOML, validated once, and handed to
//! `SinkFactory` as an immutable value.
//!
//! ```toml
//! bucket = "event-archive"
//! working_dir = "inflight"
//! publish_dir = "published"
//! sync_file_after_records = 1000
//!
//! [retry]
//! max_attempts = 5
//! initial_delay = 100   # ms
//! max_delay = 5000      # ms
//! ```

use crate::sink::client::DEFAULT_ENDPOINT;
use crate::sink::path::validate_directory;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Bucket names are 3..=63 characters (dotted names up to 222)
const BUCKET_NAME_MIN: usize = 3;
const BUCKET_NAME_MAX: usize = 222;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Main configuration for one object store sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// Target bucket
    pub bucket: String,
    /// Directory holding inflight and part objects
    pub working_dir: String,
    /// Directory holding finished files
    pub publish_dir: String,
    /// Records buffered between syncs (buffer capacity)
    #[serde(default = "default_sync_file_after_records")]
    pub sync_file_after_records: usize,
    /// Base URL of the JSON API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "duration_millis")]
    pub request_timeout: Duration,
    /// Retry settings for upload, compose and delete
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_sync_file_after_records() -> usize {
    1000
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl SinkConfig {
    /// Minimal configuration with defaults for everything optional
    pub fn new(
        bucket: impl Into<String>,
        working_dir: impl Into<String>,
        publish_dir: impl Into<String>,
    ) -> Self {
        SinkConfig {
            bucket: bucket.into(),
            working_dir: working_dir.into(),
            publish_dir: publish_dir.into(),
            sync_file_after_records: default_sync_file_after_records(),
            endpoint: default_endpoint(),
            request_timeout: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }

    /// Configuration for tests (small buffer, immediate retries)
    pub fn test(endpoint: impl Into<String>) -> Self {
        SinkConfig {
            sync_file_after_records: 4,
            endpoint: endpoint.into(),
            retry: RetryConfig::test(),
            ..SinkConfig::new("test-bucket", "inflight", "published")
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: SinkConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject settings the sink cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bucket(&self.bucket)?;
        validate_directory(&self.working_dir)
            .map_err(|reason| ConfigError::invalid("working_dir", reason))?;
        validate_directory(&self.publish_dir)
            .map_err(|reason| ConfigError::invalid("publish_dir", reason))?;
        if self.working_dir == self.publish_dir {
            return Err(ConfigError::invalid(
                "publish_dir",
                "must differ from working_dir",
            ));
        }
        if self.sync_file_after_records == 0 {
            return Err(ConfigError::invalid(
                "sync_file_after_records",
                "must be at least 1",
            ));
        }
        match url::Url::parse(&self.endpoint) {
            Ok(url) if (url.scheme() == "https" || url.scheme() == "http") && !url.cannot_be_a_base() => {}
            Ok(url) => {
                return Err(ConfigError::invalid(
                    "endpoint",
                    format!("'{}' is not an http(s) base URL", url),
                ))
            }
            Err(e) => return Err(ConfigError::invalid("endpoint", e.to_string())),
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout", "must be positive"));
        }
        self.retry.validate()
    }
}

fn validate_bucket(bucket: &str) -> Result<(), ConfigError> {
    if bucket.len() < BUCKET_NAME_MIN || bucket.len() > BUCKET_NAME_MAX {
        return Err(ConfigError::invalid(
            "bucket",
            format!(
                "'{}' must be {}..={} characters",
                bucket, BUCKET_NAME_MIN, BUCKET_NAME_MAX
            ),
        ));
    }
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    let valid_edges = bucket
        .chars()
        .next()
        .zip(bucket.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);
    if !valid_chars || !valid_edges {
        return Err(ConfigError::invalid(
            "bucket",
            format!(
                "'{}' may only contain lowercase letters, digits, '-', '_' and '.', \
                 and must start and end with a letter or digit",
                bucket
            ),
        ));
    }
    Ok(())
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter_factor: f64,
    /// Give up once this much time has passed since the first attempt
    #[serde(with = "option_duration_millis")]
    pub max_total_duration: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_total_duration: None,
        }
    }
}

impl RetryConfig {
    /// Configuration for tests (no waiting between attempts)
    pub fn test() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            max_total_duration: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "retry.initial_delay",
                format!(
                    "{:?} exceeds retry.max_delay {:?}",
                    self.initial_delay, self.max_delay
                ),
            ));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                "retry.jitter_factor",
                "must be within [0.0, 1.0]",
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for an optional Duration as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        bucket = "event-archive"
        working_dir = "inflight"
        publish_dir = "published"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SinkConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.bucket, "event-archive");
        assert_eq!(config.sync_file_after_records, 1000);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_full_config() {
        let source = r#"
            bucket = "event-archive"
            working_dir = "tmp/inflight"
            publish_dir = "data/published"
            sync_file_after_records = 250
            endpoint = "http://localhost:4443"
            request_timeout = 1500

            [retry]
            max_attempts = 7
            initial_delay = 50
            max_delay = 2000
            backoff_multiplier = 1.5
            jitter_factor = 0.25
            max_total_duration = 60000
        "#;
        let config = SinkConfig::from_toml_str(source).unwrap();
        assert_eq!(config.sync_file_after_records, 250);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_total_duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let cases = [
            ("bucket", SinkConfig { bucket: "Upper".into(), ..SinkConfig::test("http://gcs.test") }),
            ("bucket", SinkConfig { bucket: "ab".into(), ..SinkConfig::test("http://gcs.test") }),
            ("working_dir", SinkConfig { working_dir: "/abs".into(), ..SinkConfig::test("http://gcs.test") }),
            ("publish_dir", SinkConfig { publish_dir: "".into(), ..SinkConfig::test("http://gcs.test") }),
            ("publish_dir", SinkConfig { publish_dir: "inflight".into(), ..SinkConfig::test("http://gcs.test") }),
            ("sync_file_after_records", SinkConfig { sync_file_after_records: 0, ..SinkConfig::test("http://gcs.test") }),
            ("endpoint", SinkConfig::test("ftp://gcs.test")),
            ("endpoint", SinkConfig::test("not a url")),
        ];
        for (field, config) in cases {
            match config.validate() {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected invalid {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_rejects_invalid_retry() {
        let mut retry = RetryConfig::default();
        retry.max_attempts = 0;
        assert!(retry.validate().is_err());

        let mut retry = RetryConfig::default();
        retry.initial_delay = Duration::from_secs(10);
        assert!(retry.validate().is_err());

        let mut retry = RetryConfig::default();
        retry.jitter_factor = 1.5;
        assert!(retry.validate().is_err());

        let mut retry = RetryConfig::default();
        retry.backoff_multiplier = 0.5;
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let source = format!("{}\nsync_after = 5\n", MINIMAL);
        assert!(matches!(
            SinkConfig::from_toml_str(&source),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = SinkConfig::load(file.path()).unwrap();
        assert_eq!(config.publish_dir, "published");

        let missing = SinkConfig::load("/nonexistent/gcs-sink.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_serialization_roundtrip_keeps_durations() {
        let config = SinkConfig::test("http://gcs.test");
        let toml = toml::to_string(&config).unwrap();
        let parsed: SinkConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config, parsed);
    }
}
