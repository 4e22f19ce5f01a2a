//! Authoritative rule store.
//!
//! The store owns rule content. This crate only reads enabled rules per
//! tenant, so the trait has a single query.

mod error;
mod memory;
mod postgres;

pub use self::error::StoreError;
pub use self::memory::MemoryRuleStore;
pub use self::postgres::{connect_options, PgRuleStore};

use async_trait::async_trait;

use vitalwatch_core::{AlertRule, TenantId};

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Enabled rules for one tenant, ordered by rule id.
    async fn enabled_rules(&self, tenant_id: TenantId) -> Result<Vec<AlertRule>, StoreError>;

    /// Short label for logs.
    fn name(&self) -> &str;
}
