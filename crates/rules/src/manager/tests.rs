use std::sync::Arc;
use std::time::Duration;

use vitalwatch_cache::{CacheBackend, MemoryBackend, ValueCache};
use vitalwatch_core::config::RuleCacheConfig;
use vitalwatch_core::{AlertRule, InvalidationMessage, InvalidationScope, TenantId};
use vitalwatch_eisenbahn::MemoryBus;

use super::*;
use crate::store::MemoryRuleStore;

// ── Test helpers ────────────────────────────────────────────────────

fn config() -> RuleCacheConfig {
    RuleCacheConfig {
        shared_ttl_secs: 60,
        local_ttl_secs: 60,
        local_capacity: 16,
        store_timeout_ms: 200,
        warmup_lease_secs: 5,
        serializer: "structured".to_string(),
        resubscribe_max_backoff_secs: 1,
        subscribe_timeout_ms: 200,
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    cache: Arc<ValueCache>,
    store: Arc<MemoryRuleStore>,
    bus: MemoryBus,
}

impl Harness {
    fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(ValueCache::new(backend.clone(), "vw", Duration::from_millis(100)));
        let store = Arc::new(MemoryRuleStore::with_rules([
            AlertRule::threshold(1, 1, "heart_rate", Some(50.0), Some(120.0)),
            AlertRule::threshold(2, 1, "blood_oxygen", Some(90.0), None),
            AlertRule::threshold(3, 2, "temperature", None, Some(38.0)),
        ]));
        Self {
            backend,
            cache,
            store,
            bus: MemoryBus::default(),
        }
    }

    fn manager_with(&self, config: &RuleCacheConfig) -> Arc<RuleCacheManager> {
        Arc::new(RuleCacheManager::new(
            self.cache.clone(),
            self.store.clone(),
            Arc::new(self.bus.clone()),
            config,
        ))
    }

    fn manager(&self) -> Arc<RuleCacheManager> {
        self.manager_with(&config())
    }
}

fn ids(resolution: &Resolution) -> Vec<i64> {
    resolution.rules.iter().map(|r| r.id).collect()
}

// ── Tier order ──────────────────────────────────────────────────────

#[tokio::test]
async fn first_lookup_falls_back_then_hits_locally() {
    let h = Harness::new();
    let manager = h.manager();

    let first = manager.resolve(1).await;
    assert_eq!(first.source, RuleSource::Store);
    assert_eq!(ids(&first), vec![1, 2]);

    let calls = h.backend.calls();
    let second = manager.resolve(1).await;
    assert_eq!(second.source, RuleSource::Local);
    assert_eq!(ids(&second), vec![1, 2]);
    assert_eq!(h.backend.calls(), calls, "local hit must not touch the shared tier");
    assert_eq!(h.store.queries(), 1);
}

#[tokio::test]
async fn fallback_populates_shared_tier_and_tenant_set() {
    let h = Harness::new();
    h.manager().resolve(2).await;

    let snapshot = h.cache.get::<RuleSnapshot>(&tenant_key(2)).await.unwrap().decoded().unwrap();
    assert_eq!(snapshot.tenant_id, 2);
    assert_eq!(snapshot.rules.len(), 1);
    assert_eq!(h.cache.smembers(TENANTS_KEY).await, vec!["2".to_string()]);
}

#[tokio::test]
async fn second_process_hits_shared_tier() {
    let h = Harness::new();
    h.manager().resolve(1).await;

    let other = h.manager();
    let resolution = other.resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Shared);
    assert_eq!(ids(&resolution), vec![1, 2]);
    assert_eq!(h.store.queries(), 1);
    assert!(other.is_locally_cached(1));
}

#[tokio::test]
async fn opaque_snapshots_are_readable_by_structured_peers() {
    let h = Harness::new();
    let mut opaque = config();
    opaque.serializer = "opaque".to_string();
    h.manager_with(&opaque).resolve(1).await;

    let resolution = h.manager().resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Shared);
    assert_eq!(ids(&resolution), vec![1, 2]);
}

#[tokio::test]
async fn corrupt_snapshot_is_deleted_and_refetched() {
    let h = Harness::new();
    h.backend
        .set("vw:alert_rules:tenant:1", b"\xc1garbage", None)
        .await
        .unwrap();

    let manager = h.manager();
    let resolution = manager.resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Store);
    assert_eq!(ids(&resolution), vec![1, 2]);

    let stats = manager.stats().await;
    assert_eq!(stats.corrupt_entries, 1);
    // Replaced with a good snapshot.
    assert!(h.cache.get::<RuleSnapshot>(&tenant_key(1)).await.unwrap().decoded().is_some());
}

#[tokio::test]
async fn snapshot_for_wrong_tenant_is_treated_as_corrupt() {
    let h = Harness::new();
    let foreign = RuleSnapshot::new(2, &[AlertRule::threshold(3, 2, "temperature", None, Some(38.0))]);
    h.cache
        .set(&tenant_key(1), &foreign, None, vitalwatch_cache::Serializer::Structured)
        .await;

    let resolution = h.manager().resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Store);
    assert_eq!(ids(&resolution), vec![1, 2]);
}

#[tokio::test]
async fn stale_local_entry_goes_back_to_shared_tier() {
    let h = Harness::new();
    let mut cfg = config();
    cfg.local_ttl_secs = 0;
    let manager = h.manager_with(&cfg);

    assert_eq!(manager.resolve(1).await.source, RuleSource::Store);
    assert_eq!(manager.resolve(1).await.source, RuleSource::Shared);
    assert_eq!(h.store.queries(), 1);
}

#[tokio::test]
async fn tenant_without_rules_is_cached_as_empty() {
    let h = Harness::new();
    let manager = h.manager();
    assert!(manager.resolve(99).await.rules.is_empty());
    assert_eq!(manager.resolve(99).await.source, RuleSource::Local);
    assert_eq!(h.store.queries(), 1);
}

// ── Failure handling ────────────────────────────────────────────────

#[tokio::test]
async fn store_failure_is_empty_and_not_cached() {
    let h = Harness::new();
    h.store.set_failing(true);
    let manager = h.manager();

    let resolution = manager.resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Unavailable);
    assert!(resolution.rules.is_empty());
    assert!(!manager.is_locally_cached(1));

    h.store.set_failing(false);
    assert_eq!(manager.resolve(1).await.source, RuleSource::Store);
    let stats = manager.stats().await;
    assert_eq!(stats.store_errors, 1);
    assert_eq!(stats.fallbacks, 2);
}

#[tokio::test]
async fn slow_store_times_out() {
    let h = Harness::new();
    h.store.set_latency(Duration::from_millis(500));
    let resolution = h.manager().resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Unavailable);
}

#[tokio::test]
async fn shared_tier_outage_falls_back_to_store() {
    let h = Harness::new();
    h.backend.set_available(false);
    let manager = h.manager();

    let resolution = manager.resolve(1).await;
    assert_eq!(resolution.source, RuleSource::Store);
    assert_eq!(ids(&resolution), vec![1, 2]);
    assert!(!manager.connection_health());
    // Local tier still works without the shared one.
    assert_eq!(manager.resolve(1).await.source, RuleSource::Local);
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_misses_share_one_resolution() {
    let h = Harness::new();
    h.store.set_latency(Duration::from_millis(50));
    let manager = h.manager();

    let (a, b, c, d) = tokio::join!(
        manager.resolve(1),
        manager.resolve(1),
        manager.resolve(1),
        manager.resolve(1)
    );
    for r in [&a, &b, &c, &d] {
        assert_eq!(ids(r), vec![1, 2]);
    }
    assert_eq!(h.store.queries(), 1);
}

#[tokio::test]
async fn invalidation_during_resolution_is_not_overwritten() {
    let h = Harness::new();
    h.store.set_latency(Duration::from_millis(80));
    let manager = h.manager();

    let resolving = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.resolve(1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.apply_invalidation(&InvalidationMessage::new(InvalidationScope::Tenant(1), "edited"));

    let resolution = resolving.await.unwrap();
    assert_eq!(ids(&resolution), vec![1, 2], "caller still gets its result");
    assert!(!manager.is_locally_cached(1));
    assert!(!h.cache.exists(&tenant_key(1)).await);
}

#[tokio::test]
async fn concurrent_misses_share_a_failed_resolution() {
    let h = Harness::new();
    // Longer than the 200ms store timeout.
    h.store.set_latency(Duration::from_secs(1));
    let manager = h.manager();

    let started = std::time::Instant::now();
    let (a, b, c, d, e) = tokio::join!(
        manager.resolve(1),
        manager.resolve(1),
        manager.resolve(1),
        manager.resolve(1),
        manager.resolve(1)
    );
    for r in [&a, &b, &c, &d, &e] {
        assert_eq!(r.source, RuleSource::Unavailable);
        assert!(r.rules.is_empty());
    }
    assert_eq!(h.store.queries(), 1, "waiters must reuse the timed-out attempt");
    assert!(started.elapsed() < Duration::from_millis(600));

    // The failed flight is not reused by later callers.
    h.store.set_latency(Duration::ZERO);
    assert_eq!(manager.resolve(1).await.source, RuleSource::Store);
    assert_eq!(h.store.queries(), 2);
}

#[tokio::test]
async fn invalidating_another_tenant_does_not_block_caching() {
    let h = Harness::new();
    h.store.set_latency(Duration::from_millis(80));
    let manager = h.manager();

    let resolving = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.resolve(1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.apply_invalidation(&InvalidationMessage::new(InvalidationScope::Tenant(2), "edited"));

    let resolution = resolving.await.unwrap();
    assert_eq!(resolution.source, RuleSource::Store);
    assert!(manager.is_locally_cached(1));
    assert!(h.cache.exists(&tenant_key(1)).await);
}

#[tokio::test]
async fn invalidation_during_shared_write_removes_the_snapshot() {
    let h = Harness::new();
    // Slow shared tier: snapshot write spans 100ms..300ms.
    let cache = Arc::new(ValueCache::new(h.backend.clone(), "vw", Duration::from_millis(500)));
    h.backend.set_latency(Duration::from_millis(100));
    let manager = Arc::new(RuleCacheManager::new(
        cache.clone(),
        h.store.clone(),
        Arc::new(h.bus.clone()),
        &config(),
    ));

    let resolving = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.resolve(1).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.apply_invalidation(&InvalidationMessage::new(InvalidationScope::Tenant(1), "edited"));

    let resolution = resolving.await.unwrap();
    assert_eq!(ids(&resolution), vec![1, 2]);
    assert!(!manager.is_locally_cached(1));
    h.backend.set_latency(Duration::ZERO);
    assert!(!cache.exists(&tenant_key(1)).await, "snapshot written under a stale epoch");
}

#[tokio::test]
async fn local_map_is_bounded() {
    let h = Harness::new();
    let mut cfg = config();
    cfg.local_capacity = 2;
    let manager = h.manager_with(&cfg);

    for tenant in [1, 2, 3] {
        manager.resolve(tenant).await;
    }
    assert_eq!(manager.local_len(), 2);
    assert!(!manager.is_locally_cached(1), "least recently used tenant evicted");
}

// ── Invalidation and clear ──────────────────────────────────────────

#[tokio::test]
async fn tenant_invalidation_only_evicts_that_tenant() {
    let h = Harness::new();
    let manager = h.manager();
    manager.resolve(1).await;
    manager.resolve(2).await;

    manager.apply_invalidation(&InvalidationMessage::new(InvalidationScope::Tenant(1), "edited"));
    assert!(!manager.is_locally_cached(1));
    assert!(manager.is_locally_cached(2));
}

#[tokio::test]
async fn wildcard_invalidation_clears_everything_and_is_idempotent() {
    let h = Harness::new();
    let manager = h.manager();
    manager.resolve(1).await;
    manager.resolve(2).await;

    let all = InvalidationMessage::new(InvalidationScope::All, "bulk import");
    manager.apply_invalidation(&all);
    manager.apply_invalidation(&all);
    assert_eq!(manager.local_len(), 0);
    assert_eq!(manager.stats().await.invalidations, 2);
}

#[tokio::test]
async fn clear_removes_both_tiers() {
    let h = Harness::new();
    let manager = h.manager();
    manager.resolve(1).await;
    manager.resolve(2).await;

    manager.clear(Some(1)).await;
    assert!(!manager.is_locally_cached(1));
    assert!(!h.cache.exists(&tenant_key(1)).await);
    assert!(h.cache.exists(&tenant_key(2)).await);

    manager.clear(None).await;
    assert_eq!(manager.local_len(), 0);
    assert!(!h.cache.exists(&tenant_key(2)).await);
    assert!(!h.cache.exists(TENANTS_KEY).await);
}

#[tokio::test]
async fn messages_on_other_topics_are_ignored() {
    let h = Harness::new();
    let manager = h.manager();
    manager.resolve(1).await;

    let stray = vitalwatch_eisenbahn::Message::new(
        "vw.telemetry.batch",
        &InvalidationMessage::new(InvalidationScope::All, "wrong topic"),
    )
    .unwrap();
    manager.handle_bus_message(&stray);
    assert!(manager.is_locally_cached(1));
}

#[tokio::test]
async fn bare_json_invalidation_is_understood() {
    let h = Harness::new();
    let manager = h.manager();
    manager.resolve(1).await;

    let raw = vitalwatch_eisenbahn::Message::raw(
        manager.invalidation_topic(),
        br#"{"tenant_id": "1", "reason": "edited from admin"}"#.to_vec(),
    );
    manager.handle_bus_message(&raw);
    assert!(!manager.is_locally_cached(1));
}

// ── Preload ─────────────────────────────────────────────────────────

#[tokio::test]
async fn preload_leader_warms_both_tiers() {
    let h = Harness::new();
    let manager = h.manager();
    let tenants: Vec<TenantId> = vec![1, 2];

    let report = manager.preload(&tenants).await;
    assert!(report.led);
    assert_eq!(report.warmed, 2);
    assert_eq!(report.from_store, 2);
    assert!(h.cache.exists(&tenant_key(1)).await);
    assert!(manager.is_locally_cached(2));
    // Lease released.
    assert!(!h.cache.exists(WARMUP_LOCK_KEY).await);
}

#[tokio::test]
async fn long_preload_keeps_its_lease() {
    let h = Harness::new();
    let mut cfg = config();
    cfg.warmup_lease_secs = 1;
    cfg.store_timeout_ms = 1_000;
    h.store.set_latency(Duration::from_millis(400));
    let manager = h.manager_with(&cfg);

    let preloading = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.preload(&[1, 2, 3]).await })
    };
    // Past the original one-second lease, still mid-preload.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(h.cache.exists(WARMUP_LOCK_KEY).await, "lease expired during preload");

    let report = preloading.await.unwrap();
    assert!(report.led);
    assert_eq!(report.warmed, 3);
    assert!(!h.cache.exists(WARMUP_LOCK_KEY).await);
}

#[tokio::test]
async fn preload_follower_only_reads_shared_tier() {
    let h = Harness::new();
    h.manager().resolve(1).await;
    let queries = h.store.queries();

    // Another process holds the warmup lease.
    h.backend
        .set("vw:lock:alert_rules:warmup", b"someone-else", Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let follower = h.manager();
    let report = follower.preload(&[1, 2]).await;
    assert!(!report.led);
    assert_eq!(report.warmed, 1, "tenant 2 is not in the shared tier");
    assert!(follower.is_locally_cached(1));
    assert!(!follower.is_locally_cached(2));
    assert_eq!(h.store.queries(), queries);
}

#[tokio::test]
async fn preload_without_shared_tier_still_warms_locally() {
    let h = Harness::new();
    h.backend.set_available(false);
    let manager = h.manager();

    let report = manager.preload(&[1]).await;
    assert!(!report.led);
    assert_eq!(report.warmed, 1);
    assert!(manager.is_locally_cached(1));
}

#[test]
fn unknown_serializer_falls_back_to_structured() {
    let h = Harness::new();
    let mut cfg = config();
    cfg.serializer = "pickle".to_string();
    // Constructing must not panic.
    let _ = h.manager_with(&cfg);
}
