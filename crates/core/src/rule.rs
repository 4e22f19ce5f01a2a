use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub type TenantId = i64;
pub type RuleId = i64;

/// How a rule decides that a physical sign is out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Threshold,
    Trend,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Threshold => write!(f, "THRESHOLD"),
            RuleType::Trend => write!(f, "TREND"),
        }
    }
}

impl FromStr for RuleType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "THRESHOLD" => Ok(RuleType::Threshold),
            "TREND" => Ok(RuleType::Trend),
            other => Err(CoreError::UnknownRuleType(other.to_string())),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A tenant's alert condition on one physical sign.
///
/// Rules are owned by the authoritative store. This workspace only reads and
/// caches them, so there are no mutators here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub rule_type: RuleType,
    /// Telemetry channel the rule watches, e.g. `heart_rate`.
    pub physical_sign: String,
    #[serde(default)]
    pub threshold_min: Option<f64>,
    #[serde(default)]
    pub threshold_max: Option<f64>,
    /// Trend window in seconds (TREND rules only).
    #[serde(default)]
    pub trend_duration: Option<i64>,
    pub severity_level: String,
    pub alert_message: String,
    pub tenant_id: TenantId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AlertRule {
    /// Build an enabled THRESHOLD rule. Mostly used by fixtures and tests.
    pub fn threshold(
        id: RuleId,
        tenant_id: TenantId,
        physical_sign: impl Into<String>,
        threshold_min: Option<f64>,
        threshold_max: Option<f64>,
    ) -> Self {
        Self {
            id,
            rule_type: RuleType::Threshold,
            physical_sign: physical_sign.into(),
            threshold_min,
            threshold_max,
            trend_duration: None,
            severity_level: "medium".to_string(),
            alert_message: String::new(),
            tenant_id,
            enabled: true,
        }
    }

    pub fn is_threshold(&self) -> bool {
        self.rule_type == RuleType::Threshold
    }
}

// ── Invalidation ──────────────────────────────────────────────

/// Which tenants an invalidation applies to.
///
/// On the wire a single tenant is its numeric id and "all tenants" is the
/// string `"*"`. Numeric strings are accepted for publishers that quote ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireScope", into = "WireScope")]
pub enum InvalidationScope {
    Tenant(TenantId),
    All,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireScope {
    Id(TenantId),
    Text(String),
}

impl TryFrom<WireScope> for InvalidationScope {
    type Error = CoreError;

    fn try_from(raw: WireScope) -> Result<Self, Self::Error> {
        match raw {
            WireScope::Id(id) => Ok(InvalidationScope::Tenant(id)),
            WireScope::Text(s) => s.parse(),
        }
    }
}

impl From<InvalidationScope> for WireScope {
    fn from(scope: InvalidationScope) -> Self {
        match scope {
            InvalidationScope::Tenant(id) => WireScope::Id(id),
            InvalidationScope::All => WireScope::Text("*".to_string()),
        }
    }
}

impl FromStr for InvalidationScope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(InvalidationScope::All);
        }
        s.parse::<TenantId>()
            .map(InvalidationScope::Tenant)
            .map_err(|_| CoreError::InvalidScope(s.to_string()))
    }
}

impl fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationScope::Tenant(id) => write!(f, "{id}"),
            InvalidationScope::All => write!(f, "*"),
        }
    }
}

/// Published by the rule source on every rule create, update or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(rename = "tenant_id")]
    pub scope: InvalidationScope,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl InvalidationMessage {
    pub fn new(scope: InvalidationScope, reason: impl Into<String>) -> Self {
        Self {
            scope,
            reason: reason.into(),
            issued_at: Utc::now(),
        }
    }
}
