//! Namespaced cache client that never raises.
//!
//! Every public operation wraps the backend call in a timeout, logs and counts
//! any failure, and returns the caller's default (or `false` / empty). The
//! connection-health flag follows the outcome of the most recent call and of
//! the periodic liveness probe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vitalwatch_core::config::RedisConfig;

use crate::backend::redis::RedisBackend;
use crate::backend::CacheBackend;
use crate::codec::{self, CacheValue, Serializer};
use crate::error::{CacheError, CacheResult};

/// Counters exposed for operational reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub healthy: bool,
}

struct HealthProbe {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct ValueCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    op_timeout: Duration,
    healthy: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    probe: Mutex<Option<HealthProbe>>,
}

impl ValueCache {
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            op_timeout,
            healthy: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            probe: Mutex::new(None),
        }
    }

    /// Connect to Redis, verify liveness once, and start the periodic probe.
    ///
    /// Only a malformed URL is an error. An unreachable server yields a client
    /// that reports itself unhealthy and keeps retrying.
    pub async fn connect(config: &RedisConfig) -> CacheResult<Arc<Self>> {
        let backend = RedisBackend::connect(config).await?;
        let cache = Arc::new(Self::new(Arc::new(backend), config.key_prefix.clone(), config.op_timeout()));
        if !cache.ping().await {
            warn!(url = %config.redacted_url(), "shared cache unreachable at startup, continuing degraded");
        }
        cache.start_health_probe(config.health_check_interval());
        Ok(cache)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full backend key for a logical key: `{prefix}:{key}`.
    pub fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }

    pub(crate) fn backend(&self) -> &dyn CacheBackend {
        self.backend.as_ref()
    }

    /// Run one backend call under the operation timeout and record its outcome.
    pub(crate) async fn guarded<T, F>(&self, op: &'static str, key: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let result = match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(CacheError::Timeout(self.op_timeout)),
        };
        match &result {
            Ok(_) => self.healthy.store(true, Ordering::Relaxed),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if !matches!(e, CacheError::WrongType(_)) {
                    self.healthy.store(false, Ordering::Relaxed);
                }
                warn!(op, key = %key, error = %e, "cache operation failed");
            }
        }
        result
    }

    fn record_lookup(&self, found: bool) {
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Strings ───────────────────────────────────────────────

    /// Read and decode a value. `None` on a miss or any failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheValue<T>> {
        self.get_bytes(key).await.map(codec::decode)
    }

    /// Read a value, falling back to `default` on a miss, a failure, or bytes
    /// that neither decoder accepts.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get::<T>(key).await {
            Some(CacheValue::Decoded(v)) => v,
            Some(CacheValue::Raw(_)) => {
                debug!(key = %key, "cached value undecodable, using default");
                default
            }
            None => default,
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let full = self.key(key);
        let value = self
            .guarded("get", &full, self.backend.get(&full))
            .await
            .unwrap_or(None);
        self.record_lookup(value.is_some());
        value
    }

    /// Encode and store a value. Returns whether it was written.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        serializer: Serializer,
    ) -> bool {
        let full = self.key(key);
        let bytes = match serializer.encode(value) {
            Ok(b) => b,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full, serializer = %serializer, error = %e, "cache encode failed");
                return false;
            }
        };
        self.guarded("set", &full, self.backend.set(&full, &bytes, ttl))
            .await
            .is_ok()
    }

    pub async fn delete(&self, key: &str) -> bool {
        let full = self.key(key);
        self.guarded("delete", &full, self.backend.delete(&full))
            .await
            .unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full = self.key(key);
        self.guarded("exists", &full, self.backend.exists(&full))
            .await
            .unwrap_or(false)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let full = self.key(key);
        self.guarded("expire", &full, self.backend.expire(&full, ttl))
            .await
            .unwrap_or(false)
    }

    // ── Counters ──────────────────────────────────────────────

    /// Add `delta` and return the new value, `None` on failure.
    pub async fn incr(&self, key: &str, delta: i64) -> Option<i64> {
        let full = self.key(key);
        self.guarded("incr", &full, self.backend.incr_by(&full, delta))
            .await
            .ok()
    }

    pub async fn decr(&self, key: &str, delta: i64) -> Option<i64> {
        self.incr(key, delta.checked_neg()?).await
    }

    // ── Sets ──────────────────────────────────────────────────

    pub async fn sadd(&self, key: &str, member: &str) -> bool {
        let full = self.key(key);
        self.guarded("sadd", &full, self.backend.sadd(&full, member))
            .await
            .unwrap_or(false)
    }

    pub async fn srem(&self, key: &str, member: &str) -> bool {
        let full = self.key(key);
        self.guarded("srem", &full, self.backend.srem(&full, member))
            .await
            .unwrap_or(false)
    }

    pub async fn smembers(&self, key: &str) -> Vec<String> {
        let full = self.key(key);
        self.guarded("smembers", &full, self.backend.smembers(&full))
            .await
            .unwrap_or_default()
    }

    // ── Hashes ────────────────────────────────────────────────

    pub async fn hset<T: Serialize + ?Sized>(
        &self,
        key: &str,
        field: &str,
        value: &T,
        serializer: Serializer,
    ) -> bool {
        let full = self.key(key);
        let bytes = match serializer.encode(value) {
            Ok(b) => b,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full, field, error = %e, "cache encode failed");
                return false;
            }
        };
        self.guarded("hset", &full, self.backend.hset(&full, field, &bytes))
            .await
            .is_ok()
    }

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> Option<CacheValue<T>> {
        let full = self.key(key);
        let value = self
            .guarded("hget", &full, self.backend.hget(&full, field))
            .await
            .unwrap_or(None);
        self.record_lookup(value.is_some());
        value.map(codec::decode)
    }

    /// One slot per field, in request order. All `None` on failure.
    pub async fn hmget<T: DeserializeOwned>(&self, key: &str, fields: &[&str]) -> Vec<Option<CacheValue<T>>> {
        let full = self.key(key);
        match self.guarded("hmget", &full, self.backend.hmget(&full, fields)).await {
            Ok(values) => values.into_iter().map(|v| v.map(codec::decode)).collect(),
            Err(_) => fields.iter().map(|_| None).collect(),
        }
    }

    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> HashMap<String, CacheValue<T>> {
        let full = self.key(key);
        self.guarded("hgetall", &full, self.backend.hgetall(&full))
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(field, bytes)| (field, codec::decode(bytes)))
            .collect()
    }

    // ── Liveness ──────────────────────────────────────────────

    pub async fn ping(&self) -> bool {
        self.guarded("ping", "", self.backend.ping()).await.is_ok()
    }

    /// Spawn the periodic liveness probe. Returns false if one is already running.
    pub fn start_health_probe(self: &Arc<Self>, interval: Duration) -> bool {
        let mut probe = self.probe.lock().unwrap_or_else(|p| p.into_inner());
        if probe.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return false;
        }

        let shutdown = Arc::new(Notify::new());
        let weak: Weak<Self> = Arc::downgrade(self);
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(cache) = weak.upgrade() else { break };
                        let was_healthy = cache.is_healthy();
                        let healthy = cache.ping().await;
                        if healthy && !was_healthy {
                            info!("shared cache reachable again");
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
            debug!("health probe stopped");
        });
        *probe = Some(HealthProbe { handle, shutdown });
        true
    }

    /// Stop the health probe and release backend connections.
    pub async fn shutdown(&self) {
        let probe = self.probe.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(probe) = probe {
            probe.shutdown.notify_one();
            let _ = probe.handle.await;
        }
        self.backend.close().await;
        info!(prefix = %self.prefix, "value cache shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn cache_with(backend: Arc<MemoryBackend>) -> ValueCache {
        ValueCache::new(backend, "vw", Duration::from_millis(100))
    }

    #[test]
    fn keys_are_namespaced() {
        let cache = cache_with(Arc::new(MemoryBackend::new()));
        assert_eq!(cache.key("alert_rules:tenant:1"), "vw:alert_rules:tenant:1");
        let bare = ValueCache::new(Arc::new(MemoryBackend::new()), "", Duration::from_millis(10));
        assert_eq!(bare.key("k"), "k");
    }

    #[tokio::test]
    async fn writes_land_under_prefix() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_with(backend.clone());
        assert!(cache.set("greeting", "hi", None, Serializer::Structured).await);
        assert_eq!(backend.get("vw:greeting").await.unwrap(), Some(b"\"hi\"".to_vec()));
    }

    #[tokio::test]
    async fn probe_start_is_idempotent() {
        let cache = Arc::new(cache_with(Arc::new(MemoryBackend::new())));
        assert!(cache.start_health_probe(Duration::from_millis(10)));
        assert!(!cache.start_health_probe(Duration::from_millis(10)));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn probe_restores_health_flag() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(cache_with(backend.clone()));
        backend.set_available(false);
        assert!(!cache.ping().await);
        assert!(!cache.is_healthy());

        backend.set_available(true);
        cache.start_health_probe(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_healthy());
        cache.shutdown().await;
    }
}
