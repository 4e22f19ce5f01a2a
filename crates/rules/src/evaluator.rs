//! Per-record threshold evaluation over cached tenant rule sets.
//!
//! Records are independent: a record without a tenant, or a sign that does
//! not convert to a number, is logged and skipped without failing the batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use vitalwatch_core::{AlertCandidate, AlertRule, TelemetryRecord, Violation};

use crate::manager::RuleCache;

// ── Counters ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    total_processed: AtomicU64,
    cache_hits: AtomicU64,
    db_fallbacks: AtomicU64,
    alerts_generated: AtomicU64,
    skipped_records: AtomicU64,
    conversion_failures: AtomicU64,
    processing_nanos: AtomicU64,
}

/// Operational counters reported by [`AlertEvaluationEngine::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_processed: u64,
    pub cache_hits: u64,
    pub db_fallbacks: u64,
    /// `cache_hits / (cache_hits + db_fallbacks)`, 0 before any lookup.
    pub cache_hit_rate: f64,
    pub alerts_generated: u64,
    pub skipped_records: u64,
    pub conversion_failures: u64,
    /// Mean evaluation time per processed record, in milliseconds.
    pub avg_processing_time_ms: f64,
    pub connection_health: bool,
}

// ── Engine ──────────────────────────────────────────────────────────

pub struct AlertEvaluationEngine {
    rules: Arc<dyn RuleCache>,
    counters: Counters,
}

impl AlertEvaluationEngine {
    pub fn new(rules: Arc<dyn RuleCache>) -> Self {
        Self {
            rules,
            counters: Counters::default(),
        }
    }

    /// Evaluate a batch and return one candidate per violating (record, rule) pair.
    pub async fn generate_alerts(&self, records: &[TelemetryRecord]) -> Vec<AlertCandidate> {
        let started = Instant::now();
        let mut candidates = Vec::new();

        for record in records {
            self.counters.total_processed.fetch_add(1, Ordering::Relaxed);

            let Some(tenant_id) = record.tenant_id else {
                self.counters.skipped_records.fetch_add(1, Ordering::Relaxed);
                warn!(device_sn = %record.device_sn, "telemetry record without tenant, skipping");
                continue;
            };

            let resolution = self.rules.resolve(tenant_id).await;
            if resolution.source.is_cache_hit() {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.db_fallbacks.fetch_add(1, Ordering::Relaxed);
            }

            let (found, failures) = evaluate_record(record, &resolution.rules);
            if failures > 0 {
                self.counters
                    .conversion_failures
                    .fetch_add(failures, Ordering::Relaxed);
            }
            candidates.extend(found);
        }

        self.counters
            .alerts_generated
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);
        self.counters
            .processing_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        debug!(records = records.len(), alerts = candidates.len(), "batch evaluated");
        candidates
    }

    pub fn get_stats(&self) -> EngineStats {
        let c = &self.counters;
        let total_processed = c.total_processed.load(Ordering::Relaxed);
        let cache_hits = c.cache_hits.load(Ordering::Relaxed);
        let db_fallbacks = c.db_fallbacks.load(Ordering::Relaxed);
        let lookups = cache_hits + db_fallbacks;
        let nanos = c.processing_nanos.load(Ordering::Relaxed);

        EngineStats {
            total_processed,
            cache_hits,
            db_fallbacks,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            alerts_generated: c.alerts_generated.load(Ordering::Relaxed),
            skipped_records: c.skipped_records.load(Ordering::Relaxed),
            conversion_failures: c.conversion_failures.load(Ordering::Relaxed),
            avg_processing_time_ms: if total_processed == 0 {
                0.0
            } else {
                nanos as f64 / total_processed as f64 / 1_000_000.0
            },
            connection_health: self.rules.connection_health(),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.total_processed,
            &c.cache_hits,
            &c.db_fallbacks,
            &c.alerts_generated,
            &c.skipped_records,
            &c.conversion_failures,
            &c.processing_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// ── Threshold logic ─────────────────────────────────────────────────

/// Which bound `value` crosses, if any. Underflow is checked first.
pub fn check_threshold(rule: &AlertRule, value: f64) -> Option<(Violation, f64)> {
    if let Some(min) = rule.threshold_min {
        if value < min {
            return Some((Violation::Underflow, min));
        }
    }
    if let Some(max) = rule.threshold_max {
        if value > max {
            return Some((Violation::Overflow, max));
        }
    }
    None
}

/// Evaluate one record against a rule set. Returns the candidates and the
/// number of sign values that could not be read as numbers.
///
/// Only enabled THRESHOLD rules are checked; TREND rules need a window of
/// readings and are not evaluated per record.
pub fn evaluate_record(record: &TelemetryRecord, rules: &[AlertRule]) -> (Vec<AlertCandidate>, u64) {
    let mut candidates = Vec::new();
    let mut failures = 0;

    for rule in rules.iter().filter(|r| r.enabled && r.is_threshold()) {
        let value = match record.numeric_sign(&rule.physical_sign) {
            None => continue,
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                failures += 1;
                warn!(
                    device_sn = %record.device_sn,
                    rule_id = rule.id,
                    error = %e,
                    "sign value not numeric, skipping rule"
                );
                continue;
            }
        };

        if let Some((violation, bound)) = check_threshold(rule, value) {
            candidates.push(AlertCandidate {
                rule_id: rule.id,
                tenant_id: rule.tenant_id,
                device_sn: record.device_sn.clone(),
                user_id: record.user_id,
                physical_sign: rule.physical_sign.clone(),
                current_value: value,
                violation,
                threshold: bound,
                description: violation.describe(bound),
                severity_level: rule.severity_level.clone(),
                alert_message: rule.alert_message.clone(),
                recorded_at: record.timestamp,
            });
        }
    }
    (candidates, failures)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use vitalwatch_core::{RuleType, TenantId};

    use super::*;
    use crate::manager::{Resolution, RuleSource};

    /// Fixed rule sets per tenant; every lookup is a local hit.
    struct FixedRules(HashMap<TenantId, Vec<AlertRule>>);

    #[async_trait]
    impl RuleCache for FixedRules {
        async fn resolve(&self, tenant_id: TenantId) -> Resolution {
            match self.0.get(&tenant_id) {
                Some(rules) => Resolution {
                    rules: Arc::from(rules.clone()),
                    source: RuleSource::Local,
                },
                None => Resolution {
                    rules: Arc::from(Vec::new()),
                    source: RuleSource::Unavailable,
                },
            }
        }

        fn connection_health(&self) -> bool {
            true
        }
    }

    fn heart_rate_rule() -> AlertRule {
        let mut rule = AlertRule::threshold(1, 1, "heart_rate", Some(50.0), Some(120.0));
        rule.severity_level = "high".into();
        rule.alert_message = "Heart rate out of range".into();
        rule
    }

    fn engine(rules: Vec<AlertRule>) -> AlertEvaluationEngine {
        let mut by_tenant: HashMap<TenantId, Vec<AlertRule>> = HashMap::new();
        for rule in rules {
            by_tenant.entry(rule.tenant_id).or_default().push(rule);
        }
        AlertEvaluationEngine::new(Arc::new(FixedRules(by_tenant)))
    }

    #[test]
    fn bounds_are_exclusive() {
        let rule = heart_rate_rule();
        assert_eq!(check_threshold(&rule, 50.0), None);
        assert_eq!(check_threshold(&rule, 120.0), None);
        assert_eq!(check_threshold(&rule, 49.9), Some((Violation::Underflow, 50.0)));
        assert_eq!(check_threshold(&rule, 120.1), Some((Violation::Overflow, 120.0)));
    }

    #[test]
    fn open_ended_rules_check_one_side() {
        let max_only = AlertRule::threshold(1, 1, "temperature", None, Some(38.0));
        assert_eq!(check_threshold(&max_only, -100.0), None);
        let min_only = AlertRule::threshold(2, 1, "blood_oxygen", Some(90.0), None);
        assert_eq!(check_threshold(&min_only, 1_000.0), None);
    }

    #[test]
    fn heart_rate_overflow_candidate() {
        let record = TelemetryRecord::new("SN-001", 10, Some(1)).with_sign("heart_rate", 130.0);
        let (candidates, failures) = evaluate_record(&record, &[heart_rate_rule()]);

        assert_eq!(failures, 0);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.description, "overflow over 120");
        assert_eq!(c.violation, Violation::Overflow);
        assert_eq!(c.current_value, 130.0);
        assert_eq!(c.device_sn, "SN-001");
        assert_eq!(c.user_id, 10);
        assert_eq!(c.severity_level, "high");
        assert_eq!(c.alert_message, "Heart rate out of range");
        assert_eq!(c.recorded_at, record.timestamp);
    }

    #[test]
    fn trend_and_disabled_rules_are_not_evaluated() {
        let mut trend = heart_rate_rule();
        trend.rule_type = RuleType::Trend;
        trend.trend_duration = Some(300);
        let mut disabled = heart_rate_rule();
        disabled.id = 2;
        disabled.enabled = false;

        let record = TelemetryRecord::new("SN-001", 10, Some(1)).with_sign("heart_rate", 200.0);
        let (candidates, _) = evaluate_record(&record, &[trend, disabled]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn numeric_text_converts_and_garbage_is_counted() {
        let rule = heart_rate_rule();
        let numeric = TelemetryRecord::new("SN-001", 10, Some(1)).with_sign("heart_rate", "45");
        assert_eq!(evaluate_record(&numeric, &[rule.clone()]).0.len(), 1);

        let garbage = TelemetryRecord::new("SN-001", 10, Some(1)).with_sign("heart_rate", "fast");
        let (candidates, failures) = evaluate_record(&garbage, &[rule]);
        assert!(candidates.is_empty());
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn missing_tenant_is_skipped_without_failing_batch() {
        let engine = engine(vec![heart_rate_rule()]);
        let records = vec![
            TelemetryRecord::new("SN-000", 9, None).with_sign("heart_rate", 300.0),
            TelemetryRecord::new("SN-001", 10, Some(1)).with_sign("heart_rate", 130.0),
        ];

        let alerts = engine.generate_alerts(&records).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].device_sn, "SN-001");

        let stats = engine.get_stats();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.skipped_records, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.alerts_generated, 1);
    }

    #[tokio::test]
    async fn stats_track_rates_and_reset() {
        let engine = engine(vec![heart_rate_rule()]);
        let records = vec![
            TelemetryRecord::new("SN-001", 10, Some(1)).with_sign("heart_rate", 80.0),
            TelemetryRecord::new("SN-002", 11, Some(7)).with_sign("heart_rate", 80.0),
        ];
        engine.generate_alerts(&records).await;

        let stats = engine.get_stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.db_fallbacks, 1);
        assert!((stats.cache_hit_rate - 0.5).abs() < f64::EPSILON);
        assert!(stats.avg_processing_time_ms >= 0.0);
        assert!(stats.connection_health);

        engine.reset_stats();
        let stats = engine.get_stats();
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.cache_hit_rate, 0.0);
        assert_eq!(stats.avg_processing_time_ms, 0.0);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let engine = engine(Vec::new());
        assert!(engine.generate_alerts(&[]).await.is_empty());
        assert_eq!(engine.get_stats().total_processed, 0);
    }
}
