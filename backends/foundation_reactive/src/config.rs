//! Resolved client configuration.
//!
//! Loaded from TOML or built in code; every field has a default so a config
//! file only names what it changes.
//!
//! ```toml
//! connect_timeout_ms = 5000
//! follow_redirects = true
//! duplicate_response = "fail"
//! ```

use std::time::Duration;

use derive_more::derive::From;
use serde::Deserialize;

use crate::http::DEFAULT_MAX_AGGREGATE_SIZE;

/// What to do when a second response head arrives on one exchange.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateResponsePolicy {
    /// Keep the first head, log and drop the second with its body.
    #[default]
    Ignore,
    /// Fail the exchange with `ProtocolViolation` and close the channel.
    Fail,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on establishing a connection; None waits for the OS.
    pub connect_timeout_ms: Option<u64>,
    /// Client-wide default for following redirects.
    pub follow_redirects: bool,
    /// Largest response the websocket handshake aggregation accepts.
    pub max_aggregate_size: usize,
    /// Body chunks buffered before the channel reader suspends.
    pub inbound_buffer: usize,
    /// Writes queued before writers suspend.
    pub outbound_buffer: usize,
    pub read_buffer_size: usize,
    pub duplicate_response: DuplicateResponsePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            follow_redirects: false,
            max_aggregate_size: DEFAULT_MAX_AGGREGATE_SIZE,
            inbound_buffer: 16,
            outbound_buffer: 16,
            read_buffer_size: 8 * 1024,
            duplicate_response: DuplicateResponsePolicy::Ignore,
        }
    }
}

impl ClientConfig {
    /// Reads a TOML configuration file.
    ///
    /// # Errors
    ///
    /// `IOError` when the file cannot be read, `DeserializationFailed` when
    /// its content is not a valid configuration.
    pub fn from_path(target: impl Into<std::path::PathBuf>) -> ConfigResult<Self> {
        let target_path = target.into();
        let content = std::fs::read_to_string(&target_path)?;
        tracing::debug!("Loading client configuration from {}", target_path.display());
        Self::from_toml_str(&content)
    }

    /// # Errors
    ///
    /// `DeserializationFailed` when `content` is not a valid configuration.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    #[must_use]
    pub fn max_aggregate_size(mut self, size: usize) -> Self {
        self.max_aggregate_size = size;
        self
    }

    #[must_use]
    pub fn inbound_buffer(mut self, elements: usize) -> Self {
        self.inbound_buffer = elements;
        self
    }

    #[must_use]
    pub fn outbound_buffer(mut self, writes: usize) -> Self {
        self.outbound_buffer = writes;
        self
    }

    #[must_use]
    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    #[must_use]
    pub fn duplicate_response(mut self, policy: DuplicateResponsePolicy) -> Self {
        self.duplicate_response = policy;
        self
    }
}

#[derive(Debug, From)]
pub enum ConfigError {
    #[from(ignore)]
    IOError(std::io::Error),

    #[from(ignore)]
    DeserializationFailed(toml::de::Error),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::DeserializationFailed(value)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
