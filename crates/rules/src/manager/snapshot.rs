//! Shared-tier layout for cached rule sets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vitalwatch_core::{AlertRule, TenantId};

/// Set of tenant ids that currently have a snapshot in the shared tier.
pub const TENANTS_KEY: &str = "alert_rules:tenants";

/// Lease key coordinating warmup across processes.
pub const WARMUP_LOCK_KEY: &str = "lock:alert_rules:warmup";

/// Logical key of a tenant's snapshot; the cache adds its prefix.
pub fn tenant_key(tenant_id: TenantId) -> String {
    format!("alert_rules:tenant:{tenant_id}")
}

/// What is stored under [`tenant_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub tenant_id: TenantId,
    pub rules: Vec<AlertRule>,
    pub cached_at: DateTime<Utc>,
}

impl RuleSnapshot {
    pub fn new(tenant_id: TenantId, rules: &[AlertRule]) -> Self {
        Self {
            tenant_id,
            rules: rules.to_vec(),
            cached_at: Utc::now(),
        }
    }
}

/// One tenant's rule set in the process-local map.
///
/// Entries are immutable once built and shared by `Arc`, so readers never
/// see a half-filled slot.
#[derive(Debug)]
pub struct CacheEntry {
    pub tenant_id: TenantId,
    pub rules: Arc<[AlertRule]>,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(tenant_id: TenantId, rules: Arc<[AlertRule]>, ttl: Duration) -> Self {
        Self {
            tenant_id,
            rules,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) >= self.ttl
    }
}
