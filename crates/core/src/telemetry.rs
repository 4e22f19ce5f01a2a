use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::rule::TenantId;

/// One reading from a device: a set of physical signs sampled at `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_sn: String,
    pub user_id: i64,
    /// Missing on records from unbound devices. Such records are skipped.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Physical sign name → sampled value.
    #[serde(default)]
    pub signs: HashMap<String, SignValue>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(device_sn: impl Into<String>, user_id: i64, tenant_id: Option<TenantId>) -> Self {
        Self {
            device_sn: device_sn.into(),
            user_id,
            tenant_id,
            signs: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder-style sign insertion.
    pub fn with_sign(mut self, name: impl Into<String>, value: impl Into<SignValue>) -> Self {
        self.signs.insert(name.into(), value.into());
        self
    }

    /// Numeric value of a sign. `None` when the sign is absent, `Some(Err)`
    /// when it is present but not convertible.
    pub fn numeric_sign(&self, name: &str) -> Option<Result<f64, CoreError>> {
        self.signs.get(name).map(|v| v.to_f64(name))
    }
}

/// Sign values arrive either as JSON numbers or as strings from older firmware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SignValue {
    Number(f64),
    Text(String),
}

impl SignValue {
    /// Convert to a finite `f64`. NaN and infinities are rejected.
    pub fn to_f64(&self, sign: &str) -> Result<f64, CoreError> {
        let parsed = match self {
            SignValue::Number(n) => Some(*n),
            SignValue::Text(s) => s.trim().parse::<f64>().ok(),
        };
        parsed.filter(|v| v.is_finite()).ok_or_else(|| CoreError::SignConversion {
            sign: sign.to_string(),
            value: self.to_string(),
        })
    }
}

impl std::fmt::Display for SignValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignValue::Number(n) => write!(f, "{n}"),
            SignValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for SignValue {
    fn from(v: f64) -> Self {
        SignValue::Number(v)
    }
}

impl From<i64> for SignValue {
    fn from(v: i64) -> Self {
        SignValue::Number(v as f64)
    }
}

impl From<&str> for SignValue {
    fn from(v: &str) -> Self {
        SignValue::Text(v.to_string())
    }
}

impl From<String> for SignValue {
    fn from(v: String) -> Self {
        SignValue::Text(v)
    }
}
