//! Bridge configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding [`BridgeConfig::default_device`].
pub const ENV_DEFAULT_DEVICE: &str = "HOOKBRIDGE_DEFAULT_DEVICE";
/// Environment variable overriding [`BridgeConfig::execution_timeout_ms`].
pub const ENV_EXECUTION_TIMEOUT_MS: &str = "HOOKBRIDGE_EXECUTION_TIMEOUT_MS";
/// Environment variable overriding [`QueueLimits::max_messages`].
pub const ENV_QUEUE_MAX_MESSAGES: &str = "HOOKBRIDGE_QUEUE_MAX_MESSAGES";
/// Environment variable overriding [`QueueLimits::max_bytes`].
pub const ENV_QUEUE_MAX_BYTES: &str = "HOOKBRIDGE_QUEUE_MAX_BYTES";
/// Environment variable overriding [`BridgeConfig::log_methods`], comma separated.
pub const ENV_LOG_METHODS: &str = "HOOKBRIDGE_LOG_METHODS";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Limits applied to every session's message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    /// Maximum number of queued entries.
    pub max_messages: usize,
    /// Approximate byte budget across all queued entries.
    pub max_bytes: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Device used when a request names none. Falls back to the first USB device.
    pub default_device: Option<String>,

    /// Upper bound on waiting for an execution receipt. `None` or `0` waits
    /// forever.
    pub execution_timeout_ms: Option<u64>,

    /// Console methods captured into the receipt's logs. `None` captures the
    /// envelope defaults; an empty list turns capture off.
    pub log_methods: Option<Vec<String>>,

    /// Message queue limits.
    pub queue: QueueLimits,
}

impl BridgeConfig {
    /// Load a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validated()
    }

    /// Apply `HOOKBRIDGE_*` environment overrides.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if a value does not parse.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup(ENV_DEFAULT_DEVICE) {
            self.default_device = Some(device).filter(|d| !d.trim().is_empty());
        }
        if let Some(value) = lookup(ENV_EXECUTION_TIMEOUT_MS) {
            self.execution_timeout_ms = match value.trim() {
                "" | "none" | "0" => None,
                v => Some(parse(ENV_EXECUTION_TIMEOUT_MS, v)?),
            };
        }
        if let Some(value) = lookup(ENV_QUEUE_MAX_MESSAGES) {
            self.queue.max_messages = parse(ENV_QUEUE_MAX_MESSAGES, value.trim())?;
        }
        if let Some(value) = lookup(ENV_QUEUE_MAX_BYTES) {
            self.queue.max_bytes = parse(ENV_QUEUE_MAX_BYTES, value.trim())?;
        }
        if let Some(value) = lookup(ENV_LOG_METHODS) {
            self.log_methods = match value.trim() {
                "default" => None,
                v => Some(
                    v.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect(),
                ),
            };
        }
        self.validated()
    }

    /// Set the default device.
    #[must_use]
    pub fn with_default_device(mut self, device: impl Into<String>) -> Self {
        self.default_device = Some(device.into());
        self
    }

    /// Set the execution timeout.
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the captured console methods. An empty list disables capture.
    #[must_use]
    pub fn with_log_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    /// Set the queue limits.
    #[must_use]
    pub const fn with_queue_limits(mut self, limits: QueueLimits) -> Self {
        self.queue = limits;
        self
    }

    /// Execution timeout as a duration. A zero timeout reads as none.
    #[must_use]
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.queue.max_messages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.max_messages",
                value: "0".into(),
            });
        }
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
