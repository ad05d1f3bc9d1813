//! Pipeline tuning loaded from TOML.
//!
//! Every field has a default, so a partial file (or none at all) is valid:
//!
//! ```toml
//! parallelism = 4
//!
//! [retry]
//! max_attempts = 8
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

const MIB: usize = 1024 * 1024;

/// Errors from loading or validating a [`TransferConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Buffer ceilings and concurrency limits of the pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upload read queue ceiling in bytes.
    #[serde(default = "default_buffer_size")]
    pub encrypt_buffer_size: usize,

    /// Upload transmit queue ceiling in bytes.
    #[serde(default = "default_buffer_size")]
    pub upload_buffer_size: usize,

    /// Chunks sent but not yet acknowledged.
    #[serde(default = "default_max_response_queue")]
    pub max_response_queue: usize,

    /// Concurrent range fetches per download.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Upper bound of one range request in bytes.
    #[serde(default = "default_buffer_size")]
    pub max_download_chunk_size: usize,

    /// Download decrypt queue ceiling per parallel fetch, in bytes.
    #[serde(default = "default_decrypt_buffer_size")]
    pub max_decrypt_buffer_size: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_buffer_size() -> usize {
    MIB
}

fn default_max_response_queue() -> usize {
    2
}

fn default_parallelism() -> usize {
    1
}

fn default_decrypt_buffer_size() -> usize {
    2 * MIB
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            encrypt_buffer_size: default_buffer_size(),
            upload_buffer_size: default_buffer_size(),
            max_response_queue: default_max_response_queue(),
            parallelism: default_parallelism(),
            max_download_chunk_size: default_buffer_size(),
            max_decrypt_buffer_size: default_decrypt_buffer_size(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.as_ref().display(), "loaded transfer config");
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("encrypt_buffer_size", self.encrypt_buffer_size),
            ("upload_buffer_size", self.upload_buffer_size),
            ("max_response_queue", self.max_response_queue),
            ("parallelism", self.parallelism),
            ("max_download_chunk_size", self.max_download_chunk_size),
            ("max_decrypt_buffer_size", self.max_decrypt_buffer_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        self.retry.validate()
    }

    /// Decrypt queue ceiling for the configured parallelism.
    pub fn decrypt_ceiling(&self) -> usize {
        self.max_decrypt_buffer_size.saturating_mul(self.parallelism)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }
}

/// `[retry]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".into()));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_factor must be at least 1".into(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms is below retry.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}
