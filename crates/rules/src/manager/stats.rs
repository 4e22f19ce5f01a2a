use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use vitalwatch_cache::CacheStats;

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub local_hits: AtomicU64,
    pub shared_hits: AtomicU64,
    pub fallbacks: AtomicU64,
    pub store_errors: AtomicU64,
    pub corrupt_entries: AtomicU64,
    pub invalidations: AtomicU64,
    pub resubscribes: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the rule cache.
#[derive(Debug, Clone, Serialize)]
pub struct RuleCacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    /// Resolutions that went to the authoritative store, successful or not.
    pub fallbacks: u64,
    pub store_errors: u64,
    /// Shared snapshots that failed to decode and were deleted.
    pub corrupt_entries: u64,
    pub invalidations: u64,
    pub resubscribes: u64,
    pub local_entries: usize,
    pub subscriber_running: bool,
    pub shared_tier: CacheStats,
}

impl RuleCacheStats {
    pub(super) fn collect(
        counters: &Counters,
        local_entries: usize,
        subscriber_running: bool,
        shared_tier: CacheStats,
    ) -> Self {
        Self {
            local_hits: Counters::read(&counters.local_hits),
            shared_hits: Counters::read(&counters.shared_hits),
            fallbacks: Counters::read(&counters.fallbacks),
            store_errors: Counters::read(&counters.store_errors),
            corrupt_entries: Counters::read(&counters.corrupt_entries),
            invalidations: Counters::read(&counters.invalidations),
            resubscribes: Counters::read(&counters.resubscribes),
            local_entries,
            subscriber_running,
            shared_tier,
        }
    }

    /// Share of resolutions answered by either cache tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.shared_hits;
        let total = hits + self.fallbacks;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
