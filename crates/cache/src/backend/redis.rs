use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use vitalwatch_core::config::RedisConfig;

use super::CacheBackend;
use crate::error::{CacheError, CacheResult};

/// Deletes KEYS[1] only when it still holds ARGV[1]. Runs atomically on the server.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Resets the TTL of KEYS[1] to ARGV[2] milliseconds only when it still holds ARGV[1].
const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis backend over a small pool of multiplexed, auto-reconnecting connections.
///
/// Slots are filled lazily, so a backend built while Redis is down starts
/// working as soon as Redis comes back.
pub struct RedisBackend {
    client: redis::Client,
    slots: Vec<RwLock<Option<ConnectionManager>>>,
    next: AtomicUsize,
    connect_timeout: Duration,
    compare_and_delete: redis::Script,
    compare_and_expire: redis::Script,
    closed: AtomicBool,
}

impl RedisBackend {
    /// Parse the URL and size the pool. No connection is attempted.
    pub fn new(config: &RedisConfig) -> CacheResult<Self> {
        let pool_size = config.pool_size.max(1) as usize;
        Ok(Self {
            client: redis::Client::open(config.url.as_str())?,
            slots: (0..pool_size).map(|_| RwLock::new(None)).collect(),
            next: AtomicUsize::new(0),
            connect_timeout: config.connect_timeout(),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
            compare_and_expire: redis::Script::new(COMPARE_AND_EXPIRE),
            closed: AtomicBool::new(false),
        })
    }

    /// Build the backend and try to open every pool slot up front.
    ///
    /// Connection failures are logged, not returned: the slots retry on first use.
    #[instrument(skip_all, fields(url = %config.redacted_url(), pool_size = config.pool_size))]
    pub async fn connect(config: &RedisConfig) -> CacheResult<Self> {
        let backend = Self::new(config)?;
        let mut opened = 0usize;
        for slot in &backend.slots {
            match backend.open_connection().await {
                Ok(conn) => {
                    *slot.write().await = Some(conn);
                    opened += 1;
                }
                Err(e) => {
                    warn!(error = %e, "redis connection failed, slot will retry lazily");
                    break;
                }
            }
        }
        info!(opened, "redis backend ready");
        Ok(backend)
    }

    async fn open_connection(&self) -> CacheResult<ConnectionManager> {
        let conn = tokio::time::timeout(self.connect_timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| CacheError::Timeout(self.connect_timeout))??;
        Ok(conn)
    }

    /// Next pooled connection, connecting the slot if it is empty.
    async fn conn(&self) -> CacheResult<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Unavailable("redis backend closed".into()));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[idx];

        if let Some(conn) = slot.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = slot.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.open_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, Vec<u8>> = redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let reset: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(reset > 0)
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in &self.slots {
            slot.write().await.take();
        }
        info!("redis backend closed");
    }
}
