//! Configuration for Arbor: a TOML file with `[logging]`, `[cache]`, `[prefetch]` and
//! `[tiers]` sections, plus the `tracing` subscriber setup driven by `[logging]`.
//!
//! Every section and field is optional; omitted values take the same defaults as the runtime
//! configs they convert into.

mod logging;
mod size;

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use arbor_cache::{TierRoutingConfig, TreeCacheConfig};
use arbor_scheduler::PrefetchConfig;
use arbor_storage::QuotaConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use logging::{init_tracing, LoggingConfig};
pub use size::{ByteSize, ParseByteSizeError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse toml config: {0}")]
    Toml(String),

    #[error("invalid value for `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArborConfig {
    pub logging: LoggingConfig,
    pub cache: CacheSettings,
    pub prefetch: PrefetchSettings,
    pub tiers: TierRoutingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Namespace shared by the tree cache, the warm tier and the prefetch snapshot.
    pub key_prefix: String,
    /// Soft budget of the warm tier.
    pub quota_bytes: ByteSize,
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub lazy_batch_size: usize,
    /// Eviction rounds attempted when a warm-tier write exceeds the quota.
    pub max_retries: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let tree = TreeCacheConfig::default();
        let quota = QuotaConfig::default();
        Self {
            key_prefix: tree.key_prefix,
            quota_bytes: ByteSize(quota.max_bytes),
            max_entries: tree.max_entries,
            ttl_secs: tree.ttl.as_secs(),
            lazy_batch_size: tree.lazy_batch_size,
            max_retries: quota.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrefetchSettings {
    pub worker_count: usize,
    pub max_depth: u32,
    pub max_prefetched_dirs: usize,
    pub status_interval: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub deferred_segments: BTreeSet<String>,
    pub max_stall_restarts: u32,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        let prefetch = PrefetchConfig::default();
        Self {
            worker_count: prefetch.worker_count,
            max_depth: prefetch.max_depth,
            max_prefetched_dirs: prefetch.max_prefetched_dirs,
            status_interval: prefetch.status_interval,
            batch_size: prefetch.batch_size,
            batch_delay_ms: u64::try_from(prefetch.batch_delay.as_millis()).unwrap_or(u64::MAX),
            deferred_segments: prefetch.deferred_segments,
            max_stall_restarts: prefetch.max_stall_restarts,
        }
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

impl ArborConfig {
    /// Loads and validates a TOML config file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::load_from_str(&text)?;
        tracing::debug!(
            target = "arbor.config",
            path = %path.display(),
            "loaded config"
        );
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: ArborConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks that the TOML schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.cache.key_prefix.trim();
        if prefix.is_empty() {
            return Err(invalid("cache.key_prefix", "must not be empty"));
        }
        if prefix.contains(':') {
            return Err(invalid("cache.key_prefix", "must not contain `:`"));
        }
        if self.cache.quota_bytes.bytes() == 0 {
            return Err(invalid("cache.quota_bytes", "must be greater than zero"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be at least 1"));
        }
        if self.cache.lazy_batch_size == 0 {
            return Err(invalid("cache.lazy_batch_size", "must be at least 1"));
        }
        if self.prefetch.worker_count == 0 {
            return Err(invalid("prefetch.worker_count", "must be at least 1"));
        }
        if self.prefetch.max_prefetched_dirs == 0 {
            return Err(invalid("prefetch.max_prefetched_dirs", "must be at least 1"));
        }
        if self.prefetch.batch_size == 0 {
            return Err(invalid("prefetch.batch_size", "must be at least 1"));
        }
        let overlapping = self.tiers.overlapping_fields();
        if !overlapping.is_empty() {
            let names: Vec<&str> = overlapping.iter().map(|field| field.as_str()).collect();
            return Err(invalid(
                "tiers",
                format!("fields listed in more than one tier: {}", names.join(", ")),
            ));
        }
        Ok(())
    }

    pub fn tree_cache_config(&self) -> TreeCacheConfig {
        TreeCacheConfig {
            key_prefix: self.cache.key_prefix.trim().to_owned(),
            max_entries: self.cache.max_entries,
            ttl: Duration::from_secs(self.cache.ttl_secs),
            lazy_batch_size: self.cache.lazy_batch_size,
        }
    }

    /// Warm-tier quota settings; raw keys are namespaced as `<key_prefix>:`.
    pub fn quota_config(&self) -> QuotaConfig {
        QuotaConfig {
            key_prefix: format!("{}:", self.cache.key_prefix.trim()),
            max_bytes: self.cache.quota_bytes.bytes(),
            max_retries: self.cache.max_retries,
        }
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        let prefetch = &self.prefetch;
        PrefetchConfig {
            worker_count: prefetch.worker_count,
            max_depth: prefetch.max_depth,
            max_prefetched_dirs: prefetch.max_prefetched_dirs,
            status_interval: prefetch.status_interval,
            batch_size: prefetch.batch_size,
            batch_delay: Duration::from_millis(prefetch.batch_delay_ms),
            deferred_segments: prefetch.deferred_segments.clone(),
            max_stall_restarts: prefetch.max_stall_restarts,
            key_prefix: self.cache.key_prefix.trim().to_owned(),
        }
    }

    pub fn tier_routing(&self) -> TierRoutingConfig {
        self.tiers.clone()
    }
}
