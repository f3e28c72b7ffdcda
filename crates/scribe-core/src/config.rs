//! Engine configuration loaded from defaults, an optional TOML file, and `SCRIBE_*` env.
//!
//! | Key | Env | Default |
//! |-----|-----|---------|
//! | merge_window_seconds | SCRIBE_MERGE_WINDOW_SECONDS | 3.0 |
//! | flush_quiet_period_seconds | SCRIBE_FLUSH_QUIET_PERIOD_SECONDS | 2.0 |
//! | persistence_workers | SCRIBE_PERSISTENCE_WORKERS | 4 |
//! | persist_max_retries | SCRIBE_PERSIST_MAX_RETRIES | 3 |
//! | persist_retry_backoff_ms | SCRIBE_PERSIST_RETRY_BACKOFF_MS | 100 |
//! | persist_retry_backoff_max_ms | SCRIBE_PERSIST_RETRY_BACKOFF_MAX_MS | 2000 |

use crate::error::{ScribeError, ScribeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/scribe.toml";

/// Upper bound for both windows; anything longer is a misconfiguration.
const MAX_WINDOW_SECONDS: f64 = 86_400.0;

fn default_merge_window_seconds() -> f64 {
    3.0
}

fn default_flush_quiet_period_seconds() -> f64 {
    2.0
}

fn default_persistence_workers() -> usize {
    4
}

fn default_persist_max_retries() -> u32 {
    3
}

fn default_persist_retry_backoff_ms() -> u64 {
    100
}

fn default_persist_retry_backoff_max_ms() -> u64 {
    2000
}

/// Tunables for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max business-time gap between two fragments of the same utterance.
    #[serde(default = "default_merge_window_seconds")]
    pub merge_window_seconds: f64,
    /// Real-time inactivity after which an open buffer is flushed.
    #[serde(default = "default_flush_quiet_period_seconds")]
    pub flush_quiet_period_seconds: f64,
    /// Number of ordered persistence lanes.
    #[serde(default = "default_persistence_workers")]
    pub persistence_workers: usize,
    /// Retries for transient gateway failures (0 disables retrying).
    #[serde(default = "default_persist_max_retries")]
    pub persist_max_retries: u32,
    /// Initial retry backoff; doubled after each attempt.
    #[serde(default = "default_persist_retry_backoff_ms")]
    pub persist_retry_backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_persist_retry_backoff_max_ms")]
    pub persist_retry_backoff_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merge_window_seconds: default_merge_window_seconds(),
            flush_quiet_period_seconds: default_flush_quiet_period_seconds(),
            persistence_workers: default_persistence_workers(),
            persist_max_retries: default_persist_max_retries(),
            persist_retry_backoff_ms: default_persist_retry_backoff_ms(),
            persist_retry_backoff_max_ms: default_persist_retry_backoff_max_ms(),
        }
    }
}

impl EngineConfig {
    /// Load config from file and environment. Precedence: `SCRIBE_*` env > `SCRIBE_CONFIG`
    /// path (default `config/scribe.toml`) > defaults.
    pub fn load() -> ScribeResult<Self> {
        let config_path =
            std::env::var("SCRIBE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load config with the given file as the middle layer. A missing file is skipped.
    pub fn load_from(path: &Path) -> ScribeResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("merge_window_seconds", defaults.merge_window_seconds)?
            .set_default("flush_quiet_period_seconds", defaults.flush_quiet_period_seconds)?
            .set_default("persistence_workers", defaults.persistence_workers as i64)?
            .set_default("persist_max_retries", defaults.persist_max_retries as i64)?
            .set_default("persist_retry_backoff_ms", defaults.persist_retry_backoff_ms as i64)?
            .set_default(
                "persist_retry_backoff_max_ms",
                defaults.persist_retry_backoff_max_ms as i64,
            )?;

        let builder = builder.add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(false),
        );

        let built = builder
            .add_source(config::Environment::with_prefix("SCRIBE").try_parsing(true))
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ScribeResult<()> {
        if !(0.0..=MAX_WINDOW_SECONDS).contains(&self.merge_window_seconds) {
            return Err(ScribeError::Config(format!(
                "merge_window_seconds must be between 0 and {}, got {}",
                MAX_WINDOW_SECONDS, self.merge_window_seconds
            )));
        }
        if !(self.flush_quiet_period_seconds > 0.0
            && self.flush_quiet_period_seconds <= MAX_WINDOW_SECONDS)
        {
            return Err(ScribeError::Config(format!(
                "flush_quiet_period_seconds must be positive and at most {}, got {}",
                MAX_WINDOW_SECONDS, self.flush_quiet_period_seconds
            )));
        }
        if self.persistence_workers == 0 {
            return Err(ScribeError::Config(
                "persistence_workers must be at least 1".to_string(),
            ));
        }
        if self.persist_retry_backoff_max_ms < self.persist_retry_backoff_ms {
            return Err(ScribeError::Config(format!(
                "persist_retry_backoff_max_ms ({}) is below persist_retry_backoff_ms ({})",
                self.persist_retry_backoff_max_ms, self.persist_retry_backoff_ms
            )));
        }
        Ok(())
    }

    /// Merge window as a business-time duration.
    pub fn merge_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.merge_window_seconds * 1000.0).round() as i64)
    }

    /// Quiet period as a real-time duration.
    pub fn flush_quiet_period(&self) -> Duration {
        Duration::from_secs_f64(self.flush_quiet_period_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.persist_max_retries,
            initial_backoff: Duration::from_millis(self.persist_retry_backoff_ms),
            max_backoff: Duration::from_millis(self.persist_retry_backoff_max_ms),
        }
    }
}

/// Bounded exponential backoff for transient gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
