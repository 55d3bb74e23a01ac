//! Configuration management for proxyrank
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Probe batch configuration
    pub prober: ProberConfig,

    /// Subscription download configuration
    pub subscription: SubscriptionConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Probe batch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProberConfig {
    /// Maximum number of probes in flight at once
    pub max_concurrency: usize,

    /// Per-probe timeout in seconds
    pub probe_timeout_secs: u64,

    /// Pending progress events buffered before the prober waits for the consumer
    pub progress_buffer: usize,

    /// Select the fastest server after ranking
    pub auto_select: bool,
}

/// Subscription download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Retries after the first failed download
    pub max_retries: u32,

    /// Base backoff delay in milliseconds
    pub retry_base_delay_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_concurrency = env_parse("PROXYRANK_MAX_CONCURRENCY")
            .unwrap_or(defaults.prober.max_concurrency);

        let probe_timeout_secs = env_parse("PROXYRANK_PROBE_TIMEOUT")
            .unwrap_or(defaults.prober.probe_timeout_secs);

        let progress_buffer = env_parse("PROXYRANK_PROGRESS_BUFFER")
            .unwrap_or(defaults.prober.progress_buffer);

        let auto_select =
            env_parse("PROXYRANK_AUTO_SELECT").unwrap_or(defaults.prober.auto_select);

        let request_timeout_secs = env_parse("PROXYRANK_REQUEST_TIMEOUT")
            .unwrap_or(defaults.subscription.request_timeout_secs);

        let user_agent = std::env::var("PROXYRANK_USER_AGENT")
            .unwrap_or(defaults.subscription.user_agent);

        let max_retries =
            env_parse("PROXYRANK_MAX_RETRIES").unwrap_or(defaults.subscription.max_retries);

        let sqlite_path = std::env::var("PROXYRANK_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.sqlite_path);

        let level = std::env::var("PROXYRANK_LOG_LEVEL").unwrap_or(defaults.logging.level);
        let format = std::env::var("PROXYRANK_LOG_FORMAT").unwrap_or(defaults.logging.format);

        let config = Self {
            prober: ProberConfig {
                max_concurrency,
                probe_timeout_secs,
                progress_buffer,
                auto_select,
            },
            subscription: SubscriptionConfig {
                request_timeout_secs,
                user_agent,
                max_retries,
                retry_base_delay_ms: defaults.subscription.retry_base_delay_ms,
            },
            storage: StorageConfig { sqlite_path },
            logging: LoggingConfig { level, format },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.prober.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }

        if self.prober.probe_timeout_secs == 0 {
            anyhow::bail!("probe_timeout_secs must be greater than 0");
        }

        if self.prober.progress_buffer == 0 {
            anyhow::bail!("progress_buffer must be greater than 0");
        }

        if self.subscription.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Get probe timeout as Duration
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.prober.probe_timeout_secs)
    }

    /// Get subscription request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.subscription.request_timeout_secs)
    }

    /// Retry policy for subscription downloads
    #[must_use]
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.subscription.max_retries,
            self.subscription.retry_base_delay_ms,
            self.subscription.retry_base_delay_ms.saturating_mul(16),
        )
    }
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            probe_timeout_secs: 5,
            progress_buffer: 15,
            auto_select: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prober: ProberConfig::default(),
            subscription: SubscriptionConfig {
                request_timeout_secs: 30,
                user_agent: format!("proxyrank/{}", env!("CARGO_PKG_VERSION")),
                max_retries: 2,
                retry_base_delay_ms: 500,
            },
            storage: StorageConfig {
                sqlite_path: PathBuf::from("data/proxyrank.db"),
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}
