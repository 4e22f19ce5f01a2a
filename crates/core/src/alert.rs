use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rule::{RuleId, TenantId};

/// Which side of a rule's range a value fell out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    Underflow,
    Overflow,
}

impl Violation {
    /// Human-readable description, e.g. `overflow over 120`.
    pub fn describe(&self, bound: f64) -> String {
        match self {
            Violation::Underflow => format!("underflow below {bound}"),
            Violation::Overflow => format!("overflow over {bound}"),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Underflow => write!(f, "underflow"),
            Violation::Overflow => write!(f, "overflow"),
        }
    }
}

/// A (record, rule) pair that violated the rule. Handed off to the
/// persistence/notification side immediately after evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub rule_id: RuleId,
    pub tenant_id: TenantId,
    pub device_sn: String,
    pub user_id: i64,
    pub physical_sign: String,
    pub current_value: f64,
    pub violation: Violation,
    /// The bound that was crossed.
    pub threshold: f64,
    pub description: String,
    pub severity_level: String,
    pub alert_message: String,
    pub recorded_at: DateTime<Utc>,
}
