//! Byte-level storage primitives behind [`ValueCache`](crate::ValueCache).
//!
//! Keys passed to a backend are already namespaced. Backends report every
//! failure; containment is the client's job.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Overwrite `key`. `None` TTL means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    /// Set only if absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Add `delta` to an integer counter (created at 0) and return the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64>;

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> CacheResult<()>;

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<Vec<u8>>>;

    /// One slot per requested field, in order.
    async fn hmget(&self, key: &str, fields: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, Vec<u8>>>;

    /// Delete `key` only if it currently holds exactly `expected`, as one
    /// atomic step. Returns whether the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> CacheResult<bool>;

    /// Reset the TTL of `key` only if it currently holds exactly `expected`,
    /// as one atomic step. Returns whether the TTL was reset.
    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Round-trip liveness probe.
    async fn ping(&self) -> CacheResult<()>;

    /// Release connections. Later calls fail with `Unavailable`.
    async fn close(&self) {}
}
