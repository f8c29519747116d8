use std::sync::Arc;

use arbor_cache::{field_key, CacheField, Lookup, Tier, TierRouter, TierRoutingConfig};
use arbor_storage::{AsyncStorageBackend, MemoryBackend, RedbBackend, StorageBackend};
use arbor_test_utils::FailingBackend;
use serde_json::json;

struct Tiers {
    hot: Arc<FailingBackend>,
    warm: Arc<FailingBackend>,
    cold: Arc<FailingBackend>,
    router: TierRouter,
}

fn tiers() -> Tiers {
    arbor_test_utils::init_test_tracing();
    let hot = Arc::new(FailingBackend::new());
    let warm = Arc::new(FailingBackend::new());
    let cold = Arc::new(FailingBackend::new());
    let router = TierRouter::new(
        hot.clone(),
        warm.clone(),
        cold.clone(),
        TierRoutingConfig::default(),
    );
    Tiers {
        hot,
        warm,
        cold,
        router,
    }
}

const FILE: &str = "/p/src/lib.rs";

#[tokio::test]
async fn writes_land_in_the_routed_tier_only() {
    let t = tiers();
    assert_eq!(
        t.router.set(FILE, CacheField::ScrollPosition, json!(120)).await,
        Some(Tier::Hot)
    );
    assert_eq!(
        t.router.set(FILE, CacheField::Preview, json!("fn main")).await,
        Some(Tier::Warm)
    );
    assert_eq!(
        t.router
            .set(FILE, CacheField::ParsedBuffer, json!({"lines": 3}))
            .await,
        Some(Tier::Cold)
    );

    let scroll = field_key(FILE, CacheField::ScrollPosition);
    let preview = field_key(FILE, CacheField::Preview);
    let parsed = field_key(FILE, CacheField::ParsedBuffer);
    assert!(t.hot.peek(&scroll).is_some());
    assert!(t.warm.peek(&scroll).is_none() && t.cold.peek(&scroll).is_none());
    assert!(t.warm.peek(&preview).is_some());
    assert!(t.hot.peek(&preview).is_none() && t.cold.peek(&preview).is_none());
    assert!(t.cold.peek(&parsed).is_some());
    assert!(t.hot.peek(&parsed).is_none() && t.warm.peek(&parsed).is_none());
    assert_eq!(t.router.tier_stats().fallback_writes, 0);
}

#[tokio::test]
async fn lookup_order_is_hot_warm_cold_with_promotion() {
    let t = tiers();
    let key = field_key(FILE, CacheField::Highlights);
    StorageBackend::set(t.cold.as_ref(), &key, json!("cold")).unwrap();
    StorageBackend::set(t.warm.as_ref(), &key, json!("warm")).unwrap();

    // Warm shadows cold.
    assert_eq!(
        t.router.get(FILE, CacheField::Highlights).await,
        Lookup::Hit(json!("warm"))
    );
    assert_eq!(t.hot.peek(&key), Some(json!("warm")));

    // Now served from hot without touching the slower tiers.
    let warm_reads = t.warm.read_count();
    let cold_reads = t.cold.read_count();
    assert_eq!(
        t.router.get(FILE, CacheField::Highlights).await,
        Lookup::Hit(json!("warm"))
    );
    assert_eq!(t.warm.read_count(), warm_reads);
    assert_eq!(t.cold.read_count(), cold_reads);

    let stats = t.router.tier_stats();
    assert_eq!(stats.warm_hits, 1);
    assert_eq!(stats.hot_hits, 1);
    assert_eq!(stats.cold_hits, 0);
    assert_eq!(stats.promotions, 1);
}

#[tokio::test]
async fn cold_hit_is_promoted_into_hot() {
    let t = tiers();
    t.router
        .set(FILE, CacheField::ParsedBuffer, json!([1, 2, 3]))
        .await;
    assert_eq!(
        t.router.get(FILE, CacheField::ParsedBuffer).await.hit(),
        Some(json!([1, 2, 3]))
    );
    assert!(t
        .hot
        .peek(&field_key(FILE, CacheField::ParsedBuffer))
        .is_some());
    assert_eq!(t.router.tier_stats().cold_hits, 1);
}

#[tokio::test]
async fn failed_write_falls_back_towards_hot() {
    let t = tiers();
    t.warm.set_fail_writes(true);
    assert_eq!(
        t.router.set(FILE, CacheField::Stats, json!({"size": 10})).await,
        Some(Tier::Hot)
    );

    t.cold.set_fail_writes(true);
    assert_eq!(
        t.router.set(FILE, CacheField::ParsedBuffer, json!(1)).await,
        Some(Tier::Hot)
    );
    assert_eq!(t.router.tier_stats().fallback_writes, 2);

    t.hot.set_fail_writes(true);
    assert_eq!(
        t.router.set(FILE, CacheField::ScrollPosition, json!(1)).await,
        None
    );
}

#[tokio::test]
async fn tier_failure_makes_absence_unknown() {
    let t = tiers();
    assert!(t.router.get(FILE, CacheField::Errors).await.is_miss());

    t.warm.set_fail_reads(true);
    assert!(t.router.get(FILE, CacheField::Errors).await.is_unknown());

    // A slower tier can still answer.
    StorageBackend::set(
        t.cold.as_ref(),
        &field_key(FILE, CacheField::Errors),
        json!([]),
    )
    .unwrap();
    assert_eq!(
        t.router.get(FILE, CacheField::Errors).await,
        Lookup::Hit(json!([]))
    );

    let stats = t.router.tier_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.unknown, 1);
}

#[tokio::test]
async fn remove_clears_every_tier() {
    let t = tiers();
    let key = field_key(FILE, CacheField::Folds);
    for tier in [&t.hot, &t.warm, &t.cold] {
        StorageBackend::set(tier.as_ref(), &key, json!(true)).unwrap();
    }
    assert!(t.router.has(FILE, CacheField::Folds).await);

    t.router.remove(FILE, CacheField::Folds).await;
    assert!(!t.router.has(FILE, CacheField::Folds).await);
    assert!(t.router.get(FILE, CacheField::Folds).await.is_miss());
}

#[tokio::test]
async fn remove_path_drops_all_fields_of_a_file() {
    let t = tiers();
    for field in CacheField::ALL {
        t.router.set(FILE, field, json!(field.as_str())).await;
    }
    t.router.set("/p/other.rs", CacheField::Stats, json!(1)).await;

    t.router.remove_path(FILE).await;
    for field in CacheField::ALL {
        assert!(!t.router.has(FILE, field).await, "{field} survived");
    }
    assert!(t.router.has("/p/other.rs", CacheField::Stats).await);

    t.router.clear().await;
    assert!(!t.router.has("/p/other.rs", CacheField::Stats).await);
}

#[tokio::test]
async fn routing_is_configurable() {
    let mut routing = TierRoutingConfig::default();
    routing.hot_only.insert(CacheField::ParsedBuffer);
    let hot = Arc::new(MemoryBackend::new());
    let router = TierRouter::new(
        hot.clone(),
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryBackend::new()),
        routing,
    );
    assert_eq!(router.tier_for(CacheField::ParsedBuffer), Tier::Hot);
    assert_eq!(
        router.set(FILE, CacheField::ParsedBuffer, json!(1)).await,
        Some(Tier::Hot)
    );
    assert!(StorageBackend::has(hot.as_ref(), &field_key(FILE, CacheField::ParsedBuffer)).unwrap());
}

#[tokio::test]
async fn cold_tier_survives_a_new_router() {
    let cold = Arc::new(RedbBackend::in_memory().unwrap());
    let first = TierRouter::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryBackend::new()),
        cold.clone(),
        TierRoutingConfig::default(),
    );
    first
        .set(FILE, CacheField::Highlights, json!({"spans": [[0, 2]]}))
        .await;
    assert!(AsyncStorageBackend::has(cold.as_ref(), &field_key(FILE, CacheField::Highlights))
        .await
        .unwrap());

    let second = TierRouter::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryBackend::new()),
        cold,
        TierRoutingConfig::default(),
    );
    assert_eq!(
        second.get(FILE, CacheField::Highlights).await.hit(),
        Some(json!({"spans": [[0, 2]]}))
    );
}
