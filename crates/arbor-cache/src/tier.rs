use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_storage::{AsyncStorageBackend, StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::field::CacheField;
use crate::key::field_key;
use crate::lookup::Lookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    /// Read order for lookups.
    pub const READ_ORDER: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Tiers tried, in order, when writing to `self`.
    fn write_chain(self) -> &'static [Tier] {
        match self {
            Tier::Cold => &[Tier::Cold, Tier::Warm, Tier::Hot],
            Tier::Warm => &[Tier::Warm, Tier::Hot],
            Tier::Hot => &[Tier::Hot],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier each [`CacheField`] is written to.
///
/// A field listed in several sets resolves by priority `hot_only > warm > cold`; a field
/// listed nowhere goes to the cold tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierRoutingConfig {
    pub hot_only: BTreeSet<CacheField>,
    pub warm: BTreeSet<CacheField>,
    pub cold: BTreeSet<CacheField>,
}

impl Default for TierRoutingConfig {
    fn default() -> Self {
        Self {
            hot_only: [CacheField::ScrollPosition, CacheField::VisibleContent]
                .into_iter()
                .collect(),
            warm: [
                CacheField::Stats,
                CacheField::Preview,
                CacheField::Folds,
                CacheField::Brackets,
                CacheField::Errors,
            ]
            .into_iter()
            .collect(),
            cold: [CacheField::ParsedBuffer, CacheField::Highlights]
                .into_iter()
                .collect(),
        }
    }
}

impl TierRoutingConfig {
    pub fn tier_for(&self, field: CacheField) -> Tier {
        if self.hot_only.contains(&field) {
            Tier::Hot
        } else if self.warm.contains(&field) {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// Fields listed in more than one set.
    pub fn overlapping_fields(&self) -> Vec<CacheField> {
        CacheField::ALL
            .into_iter()
            .filter(|field| {
                let listed = [&self.hot_only, &self.warm, &self.cold]
                    .iter()
                    .filter(|set| set.contains(field))
                    .count();
                listed > 1
            })
            .collect()
    }
}

/// Counters reported by [`TierRouter::tier_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub cold_hits: u64,
    pub misses: u64,
    pub unknown: u64,
    pub promotions: u64,
    /// Writes that landed on a faster tier than the routed one.
    pub fallback_writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    cold_hits: AtomicU64,
    misses: AtomicU64,
    unknown: AtomicU64,
    promotions: AtomicU64,
    fallback_writes: AtomicU64,
}

/// Routes per-file fields to the hot, warm and cold tiers.
///
/// Reads always consult hot, then warm, then cold; a hit below the hot tier is copied into
/// the hot tier. Writes go to the routed tier and fall back towards the hot tier on failure.
/// Failures are logged and never returned: a cache that cannot store a value behaves as if it
/// had evicted it.
pub struct TierRouter {
    hot: Arc<dyn StorageBackend>,
    warm: Arc<dyn StorageBackend>,
    cold: Arc<dyn AsyncStorageBackend>,
    routing: TierRoutingConfig,
    counters: Counters,
}

impl fmt::Debug for TierRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierRouter")
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

impl TierRouter {
    pub fn new(
        hot: Arc<dyn StorageBackend>,
        warm: Arc<dyn StorageBackend>,
        cold: Arc<dyn AsyncStorageBackend>,
        routing: TierRoutingConfig,
    ) -> Self {
        Self {
            hot,
            warm,
            cold,
            routing,
            counters: Counters::default(),
        }
    }

    pub fn routing(&self) -> &TierRoutingConfig {
        &self.routing
    }

    pub fn tier_for(&self, field: CacheField) -> Tier {
        self.routing.tier_for(field)
    }

    async fn read_tier(&self, tier: Tier, key: &str) -> Result<Option<Value>, StorageError> {
        match tier {
            Tier::Hot => self.hot.get(key),
            Tier::Warm => self.warm.get(key),
            Tier::Cold => self.cold.get(key).await,
        }
    }

    async fn write_tier(&self, tier: Tier, key: &str, value: Value) -> Result<(), StorageError> {
        match tier {
            Tier::Hot => self.hot.set(key, value).map(drop),
            Tier::Warm => self.warm.set(key, value).map(drop),
            Tier::Cold => self.cold.set(key, value).await.map(drop),
        }
    }

    async fn remove_tier(&self, tier: Tier, key: &str) -> Result<(), StorageError> {
        match tier {
            Tier::Hot => self.hot.remove(key),
            Tier::Warm => self.warm.remove(key),
            Tier::Cold => self.cold.remove(key).await,
        }
    }

    async fn has_tier(&self, tier: Tier, key: &str) -> Result<bool, StorageError> {
        match tier {
            Tier::Hot => self.hot.has(key),
            Tier::Warm => self.warm.has(key),
            Tier::Cold => self.cold.has(key).await,
        }
    }

    /// Stores `value` and returns the tier that accepted it, or `None` when every tier in the
    /// fallback chain failed.
    pub async fn set(&self, path: &str, field: CacheField, value: Value) -> Option<Tier> {
        let key = field_key(path, field);
        let routed = self.routing.tier_for(field);
        for &tier in routed.write_chain() {
            match self.write_tier(tier, &key, value.clone()).await {
                Ok(()) => {
                    if tier != routed {
                        self.counters.fallback_writes.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            target = "arbor.cache",
                            key = %key,
                            routed = %routed,
                            tier = %tier,
                            "stored field in fallback tier"
                        );
                    }
                    return Some(tier);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "arbor.cache",
                        key = %key,
                        tier = %tier,
                        error = %err,
                        "tier write failed"
                    );
                }
            }
        }
        None
    }

    pub async fn get(&self, path: &str, field: CacheField) -> Lookup<Value> {
        let key = field_key(path, field);
        let mut failed = false;
        for tier in Tier::READ_ORDER {
            match self.read_tier(tier, &key).await {
                Ok(Some(value)) => {
                    self.record_hit(tier);
                    if tier != Tier::Hot {
                        self.promote(&key, tier, &value);
                    }
                    return Lookup::Hit(value);
                }
                Ok(None) => {}
                Err(err) => {
                    failed = true;
                    tracing::debug!(
                        target = "arbor.cache",
                        key = %key,
                        tier = %tier,
                        error = %err,
                        "tier read failed"
                    );
                }
            }
        }
        if failed {
            self.counters.unknown.fetch_add(1, Ordering::Relaxed);
            Lookup::Unknown
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            Lookup::Miss
        }
    }

    fn record_hit(&self, tier: Tier) {
        let counter = match tier {
            Tier::Hot => &self.counters.hot_hits,
            Tier::Warm => &self.counters.warm_hits,
            Tier::Cold => &self.counters.cold_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn promote(&self, key: &str, from: Tier, value: &Value) {
        match self.hot.set(key, value.clone()) {
            Ok(_) => {
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(
                    target = "arbor.cache",
                    key,
                    from = %from,
                    error = %err,
                    "failed to promote field into hot tier"
                );
            }
        }
    }

    /// `true` when any tier holds the field. Tier failures count as absence.
    pub async fn has(&self, path: &str, field: CacheField) -> bool {
        let key = field_key(path, field);
        for tier in Tier::READ_ORDER {
            match self.has_tier(tier, &key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(
                        target = "arbor.cache",
                        key = %key,
                        tier = %tier,
                        error = %err,
                        "tier lookup failed"
                    );
                }
            }
        }
        false
    }

    /// Removes the field from every tier, regardless of routing.
    pub async fn remove(&self, path: &str, field: CacheField) {
        let key = field_key(path, field);
        for tier in Tier::READ_ORDER {
            if let Err(err) = self.remove_tier(tier, &key).await {
                tracing::warn!(
                    target = "arbor.cache",
                    key = %key,
                    tier = %tier,
                    error = %err,
                    "tier remove failed"
                );
            }
        }
    }

    /// Removes every field of `path` from every tier.
    pub async fn remove_path(&self, path: &str) {
        for field in CacheField::ALL {
            self.remove(path, field).await;
        }
    }

    pub async fn clear(&self) {
        let results = [
            (Tier::Hot, self.hot.clear()),
            (Tier::Warm, self.warm.clear()),
            (Tier::Cold, self.cold.clear().await),
        ];
        for (tier, result) in results {
            if let Err(err) = result {
                tracing::warn!(
                    target = "arbor.cache",
                    tier = %tier,
                    error = %err,
                    "tier clear failed"
                );
            }
        }
    }

    pub fn tier_stats(&self) -> TierStats {
        let c = &self.counters;
        TierStats {
            hot_hits: c.hot_hits.load(Ordering::Relaxed),
            warm_hits: c.warm_hits.load(Ordering::Relaxed),
            cold_hits: c.cold_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            unknown: c.unknown.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            fallback_writes: c.fallback_writes.load(Ordering::Relaxed),
        }
    }
}
