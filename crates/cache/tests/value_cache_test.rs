//! Integration tests for the never-raise cache client.
//!
//! All run against the in-memory backend, which can be switched offline or
//! slowed down to exercise the containment paths.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vitalwatch_cache::{CacheValue, MemoryBackend, Serializer, ValueCache};

const OP_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    device_sn: String,
    value: f64,
    tags: Vec<String>,
}

fn reading() -> Reading {
    Reading {
        device_sn: "SN-001".into(),
        value: 98.6,
        tags: vec!["temp".into()],
    }
}

fn setup() -> (Arc<MemoryBackend>, ValueCache) {
    let backend = Arc::new(MemoryBackend::new());
    let cache = ValueCache::new(backend.clone(), "vw", OP_TIMEOUT);
    (backend, cache)
}

// ── Serializers ─────────────────────────────────────────────

#[tokio::test]
async fn structured_and_opaque_values_read_back() {
    let (_, cache) = setup();

    assert!(cache.set("a", &reading(), None, Serializer::Structured).await);
    assert!(cache.set("b", &reading(), None, Serializer::Opaque).await);

    assert_eq!(cache.get::<Reading>("a").await, Some(CacheValue::Decoded(reading())));
    assert_eq!(cache.get::<Reading>("b").await, Some(CacheValue::Decoded(reading())));
}

#[tokio::test]
async fn raw_bytes_come_back_untouched() {
    let (_, cache) = setup();
    let blob: Vec<u8> = vec![0xc1, 0x00, 0xff, 0x13];

    assert!(cache.set("blob", &blob, None, Serializer::Raw).await);
    assert_eq!(cache.get::<Reading>("blob").await, Some(CacheValue::Raw(blob.clone())));
    assert_eq!(cache.get_bytes("blob").await, Some(blob));
}

#[tokio::test]
async fn raw_serializer_rejects_structs_without_writing() {
    let (backend, cache) = setup();
    assert!(!cache.set("bad", &reading(), None, Serializer::Raw).await);
    assert!(backend.is_empty());
    assert_eq!(cache.stats().errors, 1);
}

#[tokio::test]
async fn get_or_falls_back_on_miss_and_undecodable() {
    let (_, cache) = setup();
    assert_eq!(cache.get_or("missing", 7i64).await, 7);

    cache.set("text", "not a number", None, Serializer::Raw).await;
    assert_eq!(cache.get_or("text", 7i64).await, 7);
}

// ── TTL and key operations ──────────────────────────────────

#[tokio::test]
async fn ttl_expires_values() {
    let (_, cache) = setup();
    cache
        .set("short", &1u32, Some(Duration::from_millis(20)), Serializer::Structured)
        .await;
    assert!(cache.exists("short").await);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!cache.exists("short").await);
}

#[tokio::test]
async fn expire_and_delete_report_presence() {
    let (_, cache) = setup();
    assert!(!cache.expire("nope", Duration::from_secs(1)).await);
    assert!(!cache.delete("nope").await);

    cache.set("k", "v", None, Serializer::Structured).await;
    assert!(cache.expire("k", Duration::from_secs(1)).await);
    assert!(cache.delete("k").await);
    assert!(!cache.exists("k").await);
}

#[tokio::test]
async fn counters_increment_and_decrement() {
    let (_, cache) = setup();
    assert_eq!(cache.incr("hits", 1).await, Some(1));
    assert_eq!(cache.incr("hits", 5).await, Some(6));
    assert_eq!(cache.decr("hits", 2).await, Some(4));
}

#[tokio::test]
async fn sets_and_hashes() {
    let (_, cache) = setup();
    assert!(cache.sadd("tenants", "1").await);
    assert!(cache.sadd("tenants", "2").await);
    assert!(!cache.sadd("tenants", "2").await);
    assert!(cache.srem("tenants", "1").await);
    assert_eq!(cache.smembers("tenants").await, vec!["2".to_string()]);

    assert!(cache.hset("dev", "SN-001", &reading(), Serializer::Opaque).await);
    assert!(cache.hset("dev", "SN-002", "offline", Serializer::Structured).await);
    assert_eq!(
        cache.hget::<Reading>("dev", "SN-001").await,
        Some(CacheValue::Decoded(reading()))
    );

    let slots = cache.hmget::<String>("dev", &["SN-002", "SN-404"]).await;
    assert_eq!(slots, vec![Some(CacheValue::Decoded("offline".to_string())), None]);

    let all = cache.hgetall::<serde_json::Value>("dev").await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn wrong_type_does_not_mark_unhealthy() {
    let (_, cache) = setup();
    cache.sadd("s", "x").await;
    assert_eq!(cache.incr("s", 1).await, None);
    assert!(cache.is_healthy());
    assert_eq!(cache.stats().errors, 1);
}

// ── Failure containment ─────────────────────────────────────

#[tokio::test]
async fn offline_backend_never_raises() {
    let (backend, cache) = setup();
    backend.set_available(false);

    assert_eq!(cache.get::<Reading>("a").await, None);
    assert_eq!(cache.get_or("a", 3u8).await, 3);
    assert!(!cache.set("a", &reading(), None, Serializer::Structured).await);
    assert!(!cache.delete("a").await);
    assert!(!cache.exists("a").await);
    assert_eq!(cache.incr("n", 1).await, None);
    assert!(cache.smembers("s").await.is_empty());
    assert_eq!(cache.hmget::<String>("h", &["x", "y"]).await, vec![None, None]);
    assert!(cache.hgetall::<String>("h").await.is_empty());
    assert!(!cache.ping().await);

    assert!(!cache.is_healthy());
    assert!(cache.stats().errors >= 10);
}

#[tokio::test]
async fn slow_backend_is_a_miss() {
    let (backend, cache) = setup();
    cache.set("k", "v", None, Serializer::Structured).await;
    backend.set_latency(Duration::from_millis(200));

    let started = std::time::Instant::now();
    assert_eq!(cache.get::<String>("k").await, None);
    assert!(started.elapsed() < Duration::from_millis(150));
    assert!(!cache.is_healthy());
}

#[tokio::test]
async fn health_recovers_after_outage() {
    let (backend, cache) = setup();
    backend.set_available(false);
    assert!(!cache.ping().await);
    backend.set_available(true);
    assert!(cache.ping().await);
    assert!(cache.is_healthy());
}

#[tokio::test]
async fn hits_and_misses_are_counted() {
    let (_, cache) = setup();
    cache.set("k", "v", None, Serializer::Structured).await;
    let _ = cache.get::<String>("k").await;
    let _ = cache.get::<String>("k").await;
    let _ = cache.get::<String>("absent").await;

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert!(stats.healthy);
}

#[tokio::test]
async fn shutdown_closes_backend_cleanly() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = Arc::new(ValueCache::new(backend, "vw", OP_TIMEOUT));
    cache.start_health_probe(Duration::from_millis(10));
    cache.shutdown().await;
    // The memory backend keeps working after close; shutdown must simply return.
    assert!(cache.ping().await);
}
