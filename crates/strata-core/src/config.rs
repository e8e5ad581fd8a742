//! Strata configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a valid
//! configuration. Durations are given in milliseconds.
//!
//! ```toml
//! data_dir = "/var/lib/strata"
//!
//! [cache]
//! capacity = 10000
//!
//! [store]
//! default_global_id = "global_singleton"
//! auto_create_parents = false
//!
//! [sync]
//! eager = true
//! push_timeout_ms = 5000
//! sweep_interval_ms = 1000
//! base_backoff_ms = 500
//! max_backoff_ms = 60000
//! max_attempts = 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parse but are inconsistent
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Directory holding the journal; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Resolution cache settings
    pub cache: CacheConfig,
    /// Context store settings
    pub store: StoreConfig,
    /// Remote sync and retry settings
    pub sync: SyncConfig,
}

impl StrataConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".into()));
        }
        if self.store.default_global_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "store.default_global_id must not be empty".into(),
            ));
        }
        if self.sync.sweep_interval_ms == 0 || self.sync.push_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.sweep_interval_ms and sync.push_timeout_ms must be > 0".into(),
            ));
        }
        if self.sync.base_backoff_ms > self.sync.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "sync.base_backoff_ms must not exceed sync.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// With data directory (enables the on-disk journal)
    #[inline]
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// With cache capacity
    #[inline]
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache.capacity = capacity;
        self
    }

    /// With eager remote push after each write
    #[inline]
    #[must_use]
    pub fn with_eager_sync(mut self, eager: bool) -> Self {
        self.sync.eager = eager;
        self
    }

    /// With lazy creation of missing parents
    #[inline]
    #[must_use]
    pub fn with_auto_create_parents(mut self, enabled: bool) -> Self {
        self.store.auto_create_parents = enabled;
        self
    }

    /// With sync settings
    #[inline]
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}

/// Resolution cache settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached resolutions before LRU eviction
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Context store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Well-known id of the per-user global record
    pub default_global_id: String,
    /// Create missing parents with empty data instead of failing
    pub auto_create_parents: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_global_id: "global_singleton".to_string(),
            auto_create_parents: false,
        }
    }
}

/// Remote sync and retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push each journal entry right after the local write
    pub eager: bool,
    /// Timeout for one remote push
    pub push_timeout_ms: u64,
    /// Interval between background retry sweeps
    pub sweep_interval_ms: u64,
    /// First retry delay
    pub base_backoff_ms: u64,
    /// Upper bound for the retry delay
    pub max_backoff_ms: u64,
    /// An entry is reported as degraded once its failures exceed this count
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            eager: true,
            push_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
            base_backoff_ms: 500,
            max_backoff_ms: 60_000,
            max_attempts: 8,
        }
    }
}

impl SyncConfig {
    /// Timeout for one remote push
    #[inline]
    #[must_use]
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// Interval between sweeps
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Delay before the next attempt after `attempts` failures
    ///
    /// Doubles from `base_backoff_ms` and saturates at `max_backoff_ms`.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}
