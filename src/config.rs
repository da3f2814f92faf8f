//! Configuration management for Riftgate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, RiftgateError};
use crate::ratelimit::LimitingShare;

/// Prefix for environment overrides, e.g. `RIFTGATE__LIMITING_SHARE=0.5`.
pub const ENV_PREFIX: &str = "RIFTGATE";

/// Main configuration for a Riftgate client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API key sent on every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Fraction of the application quota this process may consume
    #[serde(default = "default_limiting_share")]
    pub limiting_share: f64,

    /// Per-handler retry behaviour
    #[serde(default)]
    pub handlers: HandlerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            limiting_share: default_limiting_share(),
            handlers: HandlerConfig::default(),
        }
    }
}

fn default_limiting_share() -> f64 {
    1.0
}

/// How endpoint handlers react to failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Retries after a 429. Only `max_attempts` applies; the wait between
    /// attempts is the coordinator's cooldown.
    #[serde(default = "default_rate_limited")]
    pub rate_limited: BackoffConfig,

    /// Retries after a 500 or 503
    #[serde(default = "default_server_error")]
    pub server_error: BackoffConfig,

    /// Give up waiting for admission after this many seconds
    #[serde(default)]
    pub admission_timeout_secs: Option<u64>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            rate_limited: default_rate_limited(),
            server_error: default_server_error(),
            admission_timeout_secs: None,
        }
    }
}

impl HandlerConfig {
    /// The admission deadline, if one is configured.
    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout_secs.map(Duration::from_secs)
    }
}

fn default_rate_limited() -> BackoffConfig {
    BackoffConfig {
        max_attempts: 3,
        initial_backoff_ms: 1000,
        backoff_factor: 2.0,
        max_backoff_ms: default_max_backoff_ms(),
        jitter: false,
    }
}

fn default_server_error() -> BackoffConfig {
    BackoffConfig {
        max_attempts: 3,
        initial_backoff_ms: 500,
        backoff_factor: 2.0,
        max_backoff_ms: default_max_backoff_ms(),
        jitter: true,
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Multiplier applied to the delay after each retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Longest single delay, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Randomise each delay by up to half its length
    #[serde(default)]
    pub jitter: bool,
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl BackoffConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RiftgateError::Config(format!(
                "handlers.{}.max_attempts must be at least 1",
                name
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(RiftgateError::Config(format!(
                "handlers.{}.backoff_factor must be at least 1.0, got {}",
                name, self.backoff_factor
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(RiftgateError::Config(format!(
                "handlers.{}.max_backoff_ms must be at least initial_backoff_ms",
                name
            )));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading client configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RiftgateError::Config(format!("Failed to parse client config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `RIFTGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading client configuration");
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let config: ClientConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RiftgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would misbehave at runtime.
    ///
    /// An out-of-range share is an error, never clamped.
    pub fn validate(&self) -> Result<()> {
        LimitingShare::new(self.limiting_share)?;
        self.handlers.rate_limited.validate("rate_limited")?;
        self.handlers.server_error.validate("server_error")?;
        Ok(())
    }

    /// The validated limiting share.
    pub fn share(&self) -> Result<LimitingShare> {
        LimitingShare::new(self.limiting_share)
    }
}
