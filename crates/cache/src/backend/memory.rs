//! In-process backend with Redis semantics, for tests and local runs.
//!
//! Besides storage it can simulate an outage (`set_available(false)`) or a
//! slow link (`set_latency`), and counts calls so tests can assert that a code
//! path performed no I/O.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::CacheBackend;
use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the shared tier going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total operations attempted, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self) -> CacheResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory backend offline".into()));
        }
        let mut entries = self.lock();
        let now = Instant::now();
        entries.retain(|_, e| e.live(now));
        Ok(entries)
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let entries = self.enter().await?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Stored::Bytes(b)) => Ok(Some(b.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let mut entries = self.enter().await?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Bytes(value.to_vec()),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Bytes(value.to_vec()),
                expires_at: expiry(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        Ok(entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let entries = self.enter().await?;
        Ok(entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expiry(Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut entries = self.enter().await?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Bytes(b"0".to_vec()),
            expires_at: None,
        });
        let current = match &entry.value {
            Stored::Bytes(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| CacheError::WrongType(key.to_string()))?,
            _ => return Err(CacheError::WrongType(key.to_string())),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::WrongType(key.to_string()))?;
        entry.value = Stored::Bytes(next.to_string().into_bytes());
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        let removed = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Stored::Set(set)) => set.remove(member),
            Some(_) => return Err(CacheError::WrongType(key.to_string())),
        };
        // Redis drops empty sets.
        if matches!(entries.get(key).map(|e| &e.value), Some(Stored::Set(s)) if s.is_empty()) {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        let entries = self.enter().await?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Stored::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> CacheResult<()> {
        let mut entries = self.enter().await?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Hash(hash) => {
                hash.insert(field.to_string(), value.to_vec());
                Ok(())
            }
            _ => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<Vec<u8>>> {
        let entries = self.enter().await?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Stored::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let entries = self.enter().await?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Stored::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, Vec<u8>>> {
        let entries = self.enter().await?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Stored::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        let matches = matches!(
            entries.get(key).map(|e| &e.value),
            Some(Stored::Bytes(current)) if current.as_slice() == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.enter().await?;
        match entries.get_mut(key) {
            Some(entry) if matches!(&entry.value, Stored::Bytes(current) if current.as_slice() == expected) => {
                entry.expires_at = expiry(Some(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> CacheResult<()> {
        self.enter().await.map(|_| ())
    }
}
