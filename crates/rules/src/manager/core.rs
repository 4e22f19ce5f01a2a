use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, instrument, warn};

use vitalwatch_cache::{CacheValue, DistributedMutex, LockError, Serializer, ValueCache};
use vitalwatch_core::config::RuleCacheConfig;
use vitalwatch_core::{AlertRule, InvalidationMessage, InvalidationScope, TenantId};
use vitalwatch_eisenbahn::{topics, EisenbahnError, EventBus, Message};

use super::snapshot::{tenant_key, CacheEntry, RuleSnapshot, TENANTS_KEY, WARMUP_LOCK_KEY};
use super::stats::{Counters, RuleCacheStats};
use super::subscriber::{Listener, SubscriberHandle};
use super::{Resolution, RuleCache, RuleSource};
use crate::store::RuleStore;

/// Outcome of [`RuleCacheManager::preload`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreloadReport {
    /// This process held the warmup lease and filled both tiers.
    pub led: bool,
    /// Tenants now present in the local map.
    pub warmed: usize,
    /// Tenants that had to be fetched from the store.
    pub from_store: usize,
}

impl PreloadReport {
    fn record(&mut self, source: RuleSource) {
        match source {
            RuleSource::Unavailable => return,
            RuleSource::Store => self.from_store += 1,
            RuleSource::Local | RuleSource::Shared => {}
        }
        self.warmed += 1;
    }
}

/// Eviction generation a resolution started under: the wildcard generation
/// paired with the tenant's own.
type Epoch = (u64, u64);

/// One in-flight resolution per tenant. Callers that queue behind it reuse
/// its outcome, failures included.
type Flight = tokio::sync::Mutex<Option<Resolution>>;

struct LocalMap {
    entries: LruCache<TenantId, Arc<CacheEntry>>,
    /// Bumped by wildcard evictions.
    global_epoch: u64,
    /// Bumped by single-tenant evictions; reset by wildcard ones. A resolution
    /// only installs its result if its tenant's epoch is unchanged.
    tenant_epochs: HashMap<TenantId, u64>,
}

impl LocalMap {
    fn epoch(&self, tenant_id: TenantId) -> Epoch {
        (
            self.global_epoch,
            self.tenant_epochs.get(&tenant_id).copied().unwrap_or(0),
        )
    }
}

pub struct RuleCacheManager {
    cache: Arc<ValueCache>,
    store: Arc<dyn RuleStore>,
    bus: Arc<dyn EventBus>,
    topic: String,
    shared_ttl: Duration,
    local_ttl: Duration,
    store_timeout: Duration,
    warmup_lease: Duration,
    max_backoff: Duration,
    subscribe_timeout: Duration,
    serializer: Serializer,
    local: Mutex<LocalMap>,
    inflight: Mutex<HashMap<TenantId, Arc<Flight>>>,
    counters: Counters,
    subscriber: tokio::sync::Mutex<Option<SubscriberHandle>>,
}

impl RuleCacheManager {
    pub fn new(
        cache: Arc<ValueCache>,
        store: Arc<dyn RuleStore>,
        bus: Arc<dyn EventBus>,
        config: &RuleCacheConfig,
    ) -> Self {
        let serializer = config.serializer.parse().unwrap_or_else(|e| {
            warn!(error = %e, "invalid RULE_CACHE_SERIALIZER, using structured");
            Serializer::Structured
        });
        let capacity = NonZeroUsize::new(config.local_capacity).unwrap_or(NonZeroUsize::MIN);
        let topic = topics::namespaced(cache.prefix(), topics::RULES_INVALIDATED);

        Self {
            cache,
            store,
            bus,
            topic,
            shared_ttl: config.shared_ttl(),
            local_ttl: config.local_ttl(),
            store_timeout: config.store_timeout(),
            warmup_lease: config.warmup_lease(),
            max_backoff: config.resubscribe_max_backoff(),
            subscribe_timeout: config.subscribe_timeout(),
            serializer,
            local: Mutex::new(LocalMap {
                entries: LruCache::new(capacity),
                global_epoch: 0,
                tenant_epochs: HashMap::new(),
            }),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            subscriber: tokio::sync::Mutex::new(None),
        }
    }

    /// Topic the invalidation listener subscribes to.
    pub fn invalidation_topic(&self) -> &str {
        &self.topic
    }

    pub fn cache(&self) -> &Arc<ValueCache> {
        &self.cache
    }

    fn local(&self) -> MutexGuard<'_, LocalMap> {
        self.local.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Local tier ────────────────────────────────────────────

    /// Fresh local entry, if any. Stale entries are dropped on sight.
    fn local_lookup(&self, tenant_id: TenantId) -> Option<Arc<[AlertRule]>> {
        let mut local = self.local();
        let now = Instant::now();
        let cached = local
            .entries
            .get(&tenant_id)
            .map(|entry| (!entry.is_stale(now)).then(|| entry.rules.clone()));
        match cached {
            Some(Some(rules)) => Some(rules),
            Some(None) => {
                local.entries.pop(&tenant_id);
                debug!(tenant_id, "local rule entry stale");
                None
            }
            None => None,
        }
    }

    fn current_epoch(&self, tenant_id: TenantId) -> Epoch {
        self.local().epoch(tenant_id)
    }

    /// Install a resolved rule set unless an invalidation of this tenant
    /// landed meanwhile.
    fn install(&self, tenant_id: TenantId, rules: Arc<[AlertRule]>, epoch: Epoch) -> bool {
        let mut local = self.local();
        if local.epoch(tenant_id) != epoch {
            debug!(tenant_id, "invalidated during resolution, not caching locally");
            return false;
        }
        let entry = CacheEntry::new(tenant_id, rules, self.local_ttl);
        if let Some((evicted, _)) = local.entries.push(tenant_id, Arc::new(entry)) {
            if evicted != tenant_id {
                debug!(evicted, "local rule map at capacity, evicted least recent tenant");
            }
        }
        true
    }

    /// Evict one tenant or everything from the local map. Returns entries removed.
    fn evict_local(&self, scope: InvalidationScope) -> usize {
        let mut local = self.local();
        match scope {
            InvalidationScope::Tenant(id) => {
                *local.tenant_epochs.entry(id).or_default() += 1;
                usize::from(local.entries.pop(&id).is_some())
            }
            InvalidationScope::All => {
                local.global_epoch += 1;
                local.tenant_epochs.clear();
                let n = local.entries.len();
                local.entries.clear();
                n
            }
        }
    }

    pub fn local_len(&self) -> usize {
        self.local().entries.len()
    }

    /// Whether a fresh entry for `tenant_id` is in the local map. Does not
    /// touch LRU order.
    pub fn is_locally_cached(&self, tenant_id: TenantId) -> bool {
        let local = self.local();
        local
            .entries
            .peek(&tenant_id)
            .is_some_and(|e| !e.is_stale(Instant::now()))
    }

    // ── Single flight ─────────────────────────────────────────

    fn flight(&self, tenant_id: TenantId) -> Arc<Flight> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        inflight.entry(tenant_id).or_default().clone()
    }

    /// Detach a finished flight so later callers start a fresh one. Callers
    /// already queued on it still see its outcome.
    fn retire_flight(&self, tenant_id: TenantId, flight: &Arc<Flight>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if inflight.get(&tenant_id).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            inflight.remove(&tenant_id);
        }
    }

    // ── Shared tier ───────────────────────────────────────────

    /// Snapshot from the shared tier. A snapshot that does not decode, or
    /// belongs to another tenant, is deleted and reported as a miss.
    async fn load_shared(&self, tenant_id: TenantId) -> Option<Arc<[AlertRule]>> {
        let key = tenant_key(tenant_id);
        match self.cache.get::<RuleSnapshot>(&key).await {
            None => None,
            Some(CacheValue::Decoded(snapshot)) if snapshot.tenant_id == tenant_id => {
                Some(Arc::from(snapshot.rules))
            }
            Some(other) => {
                Counters::bump(&self.counters.corrupt_entries);
                warn!(tenant_id, raw = other.is_raw(), "corrupt rule snapshot, deleting");
                self.cache.delete(&key).await;
                None
            }
        }
    }

    async fn write_shared(&self, tenant_id: TenantId, rules: &[AlertRule]) -> bool {
        let snapshot = RuleSnapshot::new(tenant_id, rules);
        let written = self
            .cache
            .set(&tenant_key(tenant_id), &snapshot, Some(self.shared_ttl), self.serializer)
            .await;
        if written {
            self.cache.sadd(TENANTS_KEY, &tenant_id.to_string()).await;
        }
        written
    }

    async fn delete_shared(&self, scope: InvalidationScope) -> usize {
        match scope {
            InvalidationScope::Tenant(id) => {
                let removed = self.cache.delete(&tenant_key(id)).await;
                self.cache.srem(TENANTS_KEY, &id.to_string()).await;
                usize::from(removed)
            }
            InvalidationScope::All => {
                let mut removed = 0;
                for member in self.cache.smembers(TENANTS_KEY).await {
                    match member.parse::<TenantId>() {
                        Ok(id) => removed += usize::from(self.cache.delete(&tenant_key(id)).await),
                        Err(_) => warn!(member = %member, "non-numeric entry in tenant set"),
                    }
                }
                self.cache.delete(TENANTS_KEY).await;
                removed
            }
        }
    }

    // ── Store ─────────────────────────────────────────────────

    async fn fetch_store(&self, tenant_id: TenantId) -> Option<Vec<AlertRule>> {
        Counters::bump(&self.counters.fallbacks);
        match tokio::time::timeout(self.store_timeout, self.store.enabled_rules(tenant_id)).await {
            Ok(Ok(rules)) => {
                warn!(tenant_id, rules = rules.len(), store = self.store.name(), "rule cache miss, loaded from store");
                Some(rules)
            }
            Ok(Err(e)) => {
                Counters::bump(&self.counters.store_errors);
                warn!(tenant_id, error = %e, "rule store query failed");
                None
            }
            Err(_) => {
                Counters::bump(&self.counters.store_errors);
                warn!(tenant_id, timeout_ms = self.store_timeout.as_millis() as u64, "rule store query timed out");
                None
            }
        }
    }

    // ── Resolution ────────────────────────────────────────────

    async fn resolve_uncached(&self, tenant_id: TenantId) -> Resolution {
        let epoch = self.current_epoch(tenant_id);

        if let Some(rules) = self.load_shared(tenant_id).await {
            Counters::bump(&self.counters.shared_hits);
            self.install(tenant_id, rules.clone(), epoch);
            return Resolution {
                rules,
                source: RuleSource::Shared,
            };
        }

        match self.fetch_store(tenant_id).await {
            Some(rules) => {
                let rules: Arc<[AlertRule]> = Arc::from(rules);
                // An invalidation seen meanwhile means these rules may already be
                // outdated; keep them out of both tiers.
                if self.current_epoch(tenant_id) == epoch {
                    self.write_shared(tenant_id, &rules).await;
                    if self.current_epoch(tenant_id) != epoch {
                        debug!(tenant_id, "invalidated while writing snapshot, removing it");
                        self.cache.delete(&tenant_key(tenant_id)).await;
                    }
                }
                self.install(tenant_id, rules.clone(), epoch);
                Resolution {
                    rules,
                    source: RuleSource::Store,
                }
            }
            None => Resolution {
                rules: Arc::from(Vec::new()),
                source: RuleSource::Unavailable,
            },
        }
    }

    async fn resolve_tenant(&self, tenant_id: TenantId) -> Resolution {
        if let Some(rules) = self.local_lookup(tenant_id) {
            Counters::bump(&self.counters.local_hits);
            return Resolution {
                rules,
                source: RuleSource::Local,
            };
        }

        let flight = self.flight(tenant_id);
        let mut outcome = flight.lock().await;
        match outcome.clone() {
            // Queued behind a resolution that has finished: reuse it, even an
            // empty one, rather than asking the store again.
            Some(done) => {
                let source = if done.source == RuleSource::Unavailable {
                    RuleSource::Unavailable
                } else {
                    Counters::bump(&self.counters.local_hits);
                    RuleSource::Local
                };
                Resolution {
                    rules: done.rules,
                    source,
                }
            }
            None => {
                let resolution = match self.local_lookup(tenant_id) {
                    Some(rules) => {
                        Counters::bump(&self.counters.local_hits);
                        Resolution {
                            rules,
                            source: RuleSource::Local,
                        }
                    }
                    None => self.resolve_uncached(tenant_id).await,
                };
                *outcome = Some(resolution.clone());
                self.retire_flight(tenant_id, &flight);
                resolution
            }
        }
    }

    async fn resolve_all(&self, tenant_ids: &[TenantId]) -> PreloadReport {
        let mut report = PreloadReport::default();
        for &tenant_id in tenant_ids {
            report.record(self.resolve_tenant(tenant_id).await.source);
        }
        report
    }

    /// Leader side of `preload`: resolve every tenant, pushing the warmup
    /// lease out after each one so a long warmup keeps its leadership.
    async fn lead_preload(&self, tenant_ids: &[TenantId], lease: &DistributedMutex) -> PreloadReport {
        let mut report = PreloadReport {
            led: true,
            ..PreloadReport::default()
        };
        let mut leased = true;
        for &tenant_id in tenant_ids {
            report.record(self.resolve_tenant(tenant_id).await.source);
            if !leased {
                continue;
            }
            match lease.extend().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(tenant_id, "warmup lease lost mid-preload, another process may also lead");
                    leased = false;
                }
                Err(e) => {
                    warn!(tenant_id, error = %e, "warmup lease extension failed");
                    leased = false;
                }
            }
        }
        report
    }

    // ── Administration ────────────────────────────────────────

    /// Warm both tiers for `tenant_ids`.
    ///
    /// Only the process holding the warmup lease queries the store; a process
    /// that loses the race warms its local map from the shared tier. If the
    /// lease cannot be reached at all, each tenant resolves normally.
    #[instrument(skip_all, fields(tenants = tenant_ids.len()))]
    pub async fn preload(&self, tenant_ids: &[TenantId]) -> PreloadReport {
        let mutex = DistributedMutex::new(self.cache.clone(), WARMUP_LOCK_KEY, self.warmup_lease);
        let led = mutex.with_lock(|| self.lead_preload(tenant_ids, &mutex)).await;

        let report = match led {
            Ok(report) => report,
            Err(LockError::Contention { .. }) => {
                info!("warmup lease held elsewhere, warming local map from shared tier");
                let mut report = PreloadReport::default();
                for &tenant_id in tenant_ids {
                    let epoch = self.current_epoch(tenant_id);
                    if let Some(rules) = self.load_shared(tenant_id).await {
                        if self.install(tenant_id, rules, epoch) {
                            report.warmed += 1;
                        }
                    }
                }
                report
            }
            Err(e) => {
                warn!(error = %e, "warmup lease unreachable, preloading without coordination");
                self.resolve_all(tenant_ids).await
            }
        };
        info!(led = report.led, warmed = report.warmed, from_store = report.from_store, "rule preload finished");
        report
    }

    /// Administrative eviction from both tiers. `None` clears every tenant.
    pub async fn clear(&self, tenant_id: Option<TenantId>) {
        let scope = tenant_id.map_or(InvalidationScope::All, InvalidationScope::Tenant);
        let local = self.evict_local(scope);
        let shared = self.delete_shared(scope).await;
        info!(scope = %scope, local, shared, "rule cache cleared");
    }

    /// Rule-source side of invalidation: drop the shared snapshots, evict
    /// locally, and tell every other process.
    pub async fn invalidate(&self, scope: InvalidationScope, reason: &str) -> Result<(), EisenbahnError> {
        self.delete_shared(scope).await;
        self.evict_local(scope);

        let message = InvalidationMessage::new(scope, reason);
        let publisher = self.bus.publisher().await?;
        publisher.publish(Message::new(&self.topic, &message)?).await?;
        info!(scope = %scope, reason, topic = %self.topic, "published rule invalidation");
        Ok(())
    }

    /// Apply an invalidation received from the bus. No eager refetch.
    pub fn apply_invalidation(&self, message: &InvalidationMessage) {
        Counters::bump(&self.counters.invalidations);
        let evicted = self.evict_local(message.scope);
        info!(
            scope = %message.scope,
            reason = %message.reason,
            evicted,
            "rules invalidated"
        );
    }

    pub(super) fn handle_bus_message(&self, message: &Message) {
        if message.topic != self.topic {
            debug!(topic = %message.topic, "ignoring message on unrelated topic");
            return;
        }
        match message.decode::<InvalidationMessage>() {
            Ok(invalidation) => self.apply_invalidation(&invalidation),
            Err(e) => warn!(error = %e, "undecodable invalidation message"),
        }
    }

    /// Invalidations may have been missed while the listener was away.
    pub(super) fn on_resubscribed(&self) {
        Counters::bump(&self.counters.resubscribes);
        let evicted = self.evict_local(InvalidationScope::All);
        warn!(evicted, "invalidation listener resubscribed, local rule map cleared");
    }

    // ── Subscriber lifecycle ──────────────────────────────────

    /// Start the invalidation listener. Returns false if it is already
    /// running. Waits until the first subscription attempt settles, so
    /// invalidations published after this returns are seen when the broker
    /// is reachable.
    pub async fn start_subscriber(self: &Arc<Self>) -> bool {
        let mut slot = self.subscriber.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let shutdown = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = Listener::new(
            Arc::downgrade(self),
            self.bus.clone(),
            self.topic.clone(),
            self.max_backoff,
            self.subscribe_timeout,
            shutdown.clone(),
        );
        let handle = tokio::spawn(listener.run(ready_tx));
        *slot = Some(SubscriberHandle::new(handle, shutdown));
        drop(slot);

        match ready_rx.await {
            Ok(true) => info!(topic = %self.topic, "invalidation subscriber started"),
            _ => warn!(topic = %self.topic, "invalidation subscriber started without a broker connection, retrying"),
        }
        true
    }

    /// Signal the listener, wait for it to exit, and drop its broker
    /// connection. Returns false if it was not running.
    pub async fn stop_subscriber(&self) -> bool {
        let handle = self.subscriber.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                info!("invalidation subscriber stopped");
                true
            }
            None => false,
        }
    }

    pub async fn subscriber_running(&self) -> bool {
        self.subscriber
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn stats(&self) -> RuleCacheStats {
        RuleCacheStats::collect(
            &self.counters,
            self.local_len(),
            self.subscriber_running().await,
            self.cache.stats(),
        )
    }
}

#[async_trait]
impl RuleCache for RuleCacheManager {
    async fn resolve(&self, tenant_id: TenantId) -> Resolution {
        self.resolve_tenant(tenant_id).await
    }

    fn connection_health(&self) -> bool {
        self.cache.is_healthy()
    }
}
