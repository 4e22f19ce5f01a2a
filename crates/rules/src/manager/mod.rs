//! Two-tier cache of per-tenant alert rules.
//!
//! Lookups go process-local map → shared tier → authoritative store, filling
//! the tiers they missed on the way back. A background listener evicts local
//! entries when the rule source publishes an invalidation.

mod core;
mod snapshot;
mod stats;
mod subscriber;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;

use vitalwatch_core::{AlertRule, TenantId};

pub use self::core::{PreloadReport, RuleCacheManager};
pub use self::snapshot::{tenant_key, CacheEntry, RuleSnapshot, TENANTS_KEY, WARMUP_LOCK_KEY};
pub use self::stats::RuleCacheStats;

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Local,
    Shared,
    Store,
    /// Every tier failed; the rule set is empty for this call only.
    Unavailable,
}

impl RuleSource {
    pub fn is_cache_hit(&self) -> bool {
        matches!(self, RuleSource::Local | RuleSource::Shared)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub rules: Arc<[AlertRule]>,
    pub source: RuleSource,
}

/// Read side of the rule cache, as seen by the evaluation engine.
#[async_trait]
pub trait RuleCache: Send + Sync {
    /// Resolve a tenant's rule set. Never fails; total failure is an empty
    /// set with [`RuleSource::Unavailable`].
    async fn resolve(&self, tenant_id: TenantId) -> Resolution;

    async fn get_rules(&self, tenant_id: TenantId) -> Vec<AlertRule> {
        self.resolve(tenant_id).await.rules.to_vec()
    }

    /// Whether the shared tier answered its most recent call.
    fn connection_health(&self) -> bool;
}
