//! Per-tenant alert rule caching and telemetry evaluation.
//!
//! This crate provides:
//! - [`RuleStore`]: the authoritative rule source (PostgreSQL or in-memory)
//! - [`RuleCacheManager`]: local LRU + shared-tier cache of tenant rule sets,
//!   with bus-driven invalidation and coordinated warmup
//! - [`AlertEvaluationEngine`]: threshold evaluation of telemetry batches

pub mod evaluator;
pub mod manager;
pub mod store;

pub use evaluator::{AlertEvaluationEngine, EngineStats};
pub use manager::{
    CacheEntry, PreloadReport, Resolution, RuleCache, RuleCacheManager, RuleCacheStats, RuleSnapshot,
    RuleSource,
};
pub use store::{MemoryRuleStore, PgRuleStore, RuleStore, StoreError};
