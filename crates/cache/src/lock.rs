//! Lease-based mutual exclusion across processes.
//!
//! Acquisition is a set-if-absent write of a per-instance token with a lease
//! TTL, so a crashed holder can never block the lock past its lease. Release
//! deletes the key only while it still holds our token, in one atomic step on
//! the server.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::value_cache::ValueCache;

pub struct DistributedMutex {
    cache: Arc<ValueCache>,
    key: String,
    token: String,
    lease: Duration,
    held: AtomicBool,
}

impl DistributedMutex {
    /// `name` is a logical key; it is namespaced by the cache prefix.
    pub fn new(cache: Arc<ValueCache>, name: &str, lease: Duration) -> Self {
        let key = cache.key(name);
        Self {
            cache,
            key,
            token: Uuid::new_v4().to_string(),
            lease,
            held: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Whether this instance believes it holds the lease. The lease may have
    /// expired on the server since.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Try once to take the lease. Never blocks waiting for another holder.
    pub async fn acquire(&self) -> Result<(), LockError> {
        let backend = self.cache.backend();
        let written = self
            .cache
            .guarded(
                "lock_acquire",
                &self.key,
                backend.set_nx(&self.key, self.token.as_bytes(), self.lease),
            )
            .await
            .map_err(|source| LockError::Connectivity {
                key: self.key.clone(),
                source,
            })?;

        if !written {
            debug!(key = %self.key, "lock contended");
            return Err(LockError::Contention { key: self.key.clone() });
        }
        self.held.store(true, Ordering::Release);
        debug!(key = %self.key, lease_ms = self.lease.as_millis() as u64, "lock acquired");
        Ok(())
    }

    /// Release the lease if we still own it.
    ///
    /// Returns `Ok(false)` when the lease had already expired or been taken by
    /// someone else; the other holder's key is left untouched.
    pub async fn release(&self) -> Result<bool, LockError> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Err(LockError::NotHeld { key: self.key.clone() });
        }
        let backend = self.cache.backend();
        let removed = self
            .cache
            .guarded(
                "lock_release",
                &self.key,
                backend.compare_and_delete(&self.key, self.token.as_bytes()),
            )
            .await
            .map_err(|source| LockError::Connectivity {
                key: self.key.clone(),
                source,
            })?;

        if !removed {
            warn!(key = %self.key, "lease lost before release");
        }
        Ok(removed)
    }

    /// Push the lease expiry out by another full lease, if we still own it.
    ///
    /// Returns `Ok(false)` when the lease was lost; the instance then stops
    /// considering itself the holder.
    pub async fn extend(&self) -> Result<bool, LockError> {
        if !self.is_held() {
            return Err(LockError::NotHeld { key: self.key.clone() });
        }
        let backend = self.cache.backend();
        let extended = self
            .cache
            .guarded(
                "lock_extend",
                &self.key,
                backend.compare_and_expire(&self.key, self.token.as_bytes(), self.lease),
            )
            .await
            .map_err(|source| LockError::Connectivity {
                key: self.key.clone(),
                source,
            })?;

        if !extended {
            self.held.store(false, Ordering::Release);
            warn!(key = %self.key, "lease lost before extension");
        }
        Ok(extended)
    }

    /// Run `f` while holding the lease and release on every exit path.
    ///
    /// Fails without running `f` when the lease cannot be acquired.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await?;
        let guard = ReleaseOnDrop { mutex: Some(self) };
        let out = f().await;
        guard.disarm();
        if let Err(e) = self.release().await {
            warn!(key = %self.key, error = %e, "lock release failed, lease will expire");
        }
        Ok(out)
    }
}

/// Covers a cancelled or panicking critical section: the lease is released in
/// the background instead of lingering until it expires.
struct ReleaseOnDrop<'a> {
    mutex: Option<&'a DistributedMutex>,
}

impl ReleaseOnDrop<'_> {
    fn disarm(mut self) {
        self.mutex = None;
    }
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        let Some(mutex) = self.mutex.take() else { return };
        if !mutex.held.swap(false, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = mutex.cache.clone();
        let key = mutex.key.clone();
        let token = mutex.token.clone();
        runtime.spawn(async move {
            let backend = cache.backend();
            let _ = cache
                .guarded("lock_release", &key, backend.compare_and_delete(&key, token.as_bytes()))
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn cache() -> Arc<ValueCache> {
        Arc::new(ValueCache::new(
            Arc::new(MemoryBackend::new()),
            "vw",
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn tokens_are_unique_per_instance() {
        let cache = cache();
        let a = DistributedMutex::new(cache.clone(), "lock:x", Duration::from_secs(1));
        let b = DistributedMutex::new(cache, "lock:x", Duration::from_secs(1));
        assert_ne!(a.token(), b.token());
        assert_eq!(a.key(), "vw:lock:x");
    }

    #[tokio::test]
    async fn release_without_acquire_is_not_held() {
        let m = DistributedMutex::new(cache(), "lock:x", Duration::from_secs(1));
        assert!(matches!(m.release().await, Err(LockError::NotHeld { .. })));
    }

    #[tokio::test]
    async fn dropped_critical_section_still_releases() {
        let cache = cache();
        let m = Arc::new(DistributedMutex::new(cache.clone(), "lock:x", Duration::from_secs(30)));

        let inner = m.clone();
        let task = tokio::spawn(async move {
            inner
                .with_lock(|| async { tokio::time::sleep(Duration::from_secs(60)).await })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.exists("lock:x").await);

        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!cache.exists("lock:x").await);
    }
}
