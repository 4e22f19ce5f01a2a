use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use vitalwatch_core::{AlertRule, TenantId};

use super::{RuleStore, StoreError};

/// In-memory rule store for tests and fixtures.
///
/// Counts queries so tests can prove a path was served from cache, and can be
/// failed or slowed down to exercise fallback paths.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<TenantId, Vec<AlertRule>>>,
    queries: AtomicU64,
    failing: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a flat list of rules, grouped by tenant.
    pub fn with_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let store = Self::new();
        for rule in rules {
            store.insert(rule);
        }
        store
    }

    /// Add or replace a rule (matched by id within its tenant).
    pub fn insert(&self, rule: AlertRule) {
        let mut rules = self.rules.write().unwrap_or_else(|p| p.into_inner());
        let tenant = rules.entry(rule.tenant_id).or_default();
        tenant.retain(|r| r.id != rule.id);
        tenant.push(rule);
        tenant.sort_by_key(|r| r.id);
    }

    pub fn remove(&self, tenant_id: TenantId, rule_id: i64) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(|p| p.into_inner());
        match rules.get_mut(&tenant_id) {
            Some(tenant) => {
                let before = tenant.len();
                tenant.retain(|r| r.id != rule_id);
                tenant.len() != before
            }
            None => false,
        }
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn enabled_rules(&self, tenant_id: TenantId) -> Result<Vec<AlertRule>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store failing".into()));
        }
        let rules = self.rules.read().unwrap_or_else(|p| p.into_inner());
        Ok(rules
            .get(&tenant_id)
            .map(|rules| rules.iter().filter(|r| r.enabled).cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
