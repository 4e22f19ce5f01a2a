use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use vitalwatch_core::config::PostgresConfig;
use vitalwatch_core::{AlertRule, RuleType, TenantId};

use super::{RuleStore, StoreError};

const ENABLED_RULES_SQL: &str = "SELECT id, rule_type, physical_sign, threshold_min, threshold_max,
        trend_duration, severity_level, alert_message, tenant_id, enabled
 FROM alert_rules
 WHERE tenant_id = $1 AND enabled = TRUE
 ORDER BY id";

#[derive(Debug, sqlx::FromRow)]
struct AlertRuleRow {
    id: i64,
    rule_type: String,
    physical_sign: String,
    threshold_min: Option<f64>,
    threshold_max: Option<f64>,
    trend_duration: Option<i64>,
    severity_level: String,
    alert_message: Option<String>,
    tenant_id: i64,
    enabled: bool,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = StoreError;

    fn try_from(row: AlertRuleRow) -> Result<Self, Self::Error> {
        let rule_type: RuleType = row.rule_type.parse().map_err(|e| StoreError::InvalidRow {
            rule_id: row.id,
            reason: format!("{e}"),
        })?;
        Ok(AlertRule {
            id: row.id,
            rule_type,
            physical_sign: row.physical_sign,
            threshold_min: row.threshold_min,
            threshold_max: row.threshold_max,
            trend_duration: row.trend_duration,
            severity_level: row.severity_level,
            alert_message: row.alert_message.unwrap_or_default(),
            tenant_id: row.tenant_id,
            enabled: row.enabled,
        })
    }
}

/// Connection options built field by field, so credentials never pass
/// through a URL and need no escaping.
pub fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, StoreError> {
    let ssl_mode: PgSslMode = config.ssl_mode.parse()?;
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(config.username.as_deref().unwrap_or("postgres"))
        .ssl_mode(ssl_mode);
    Ok(match config.password.as_deref() {
        Some(password) => options.password(password),
        None => options,
    })
}

/// Rule store backed by the `alert_rules` table.
pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect lazily: the pool opens connections on first query, so the
    /// worker can start before the database is reachable.
    #[instrument(skip_all, fields(host = %config.host, database = %config.database))]
    pub fn connect_lazy(config: &PostgresConfig) -> Result<Self, StoreError> {
        if !config.is_configured() {
            warn!("PG_USERNAME not set, connecting with default credentials");
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy_with(connect_options(config)?);
        info!("rule store pool configured");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn enabled_rules(&self, tenant_id: TenantId) -> Result<Vec<AlertRule>, StoreError> {
        let rows = sqlx::query_as::<_, AlertRuleRow>(ENABLED_RULES_SQL)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            match AlertRule::try_from(row) {
                Ok(rule) => rules.push(rule),
                // One bad row must not hide the tenant's other rules.
                Err(e) => warn!(tenant_id, error = %e, "skipping unreadable rule row"),
            }
        }
        Ok(rules)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(rule_type: &str) -> AlertRuleRow {
        AlertRuleRow {
            id: 7,
            rule_type: rule_type.to_string(),
            physical_sign: "heart_rate".to_string(),
            threshold_min: Some(50.0),
            threshold_max: Some(120.0),
            trend_duration: None,
            severity_level: "high".to_string(),
            alert_message: None,
            tenant_id: 1,
            enabled: true,
        }
    }

    #[test]
    fn row_converts_to_rule() {
        let rule = AlertRule::try_from(row("threshold")).unwrap();
        assert_eq!(rule.rule_type, RuleType::Threshold);
        assert_eq!(rule.threshold_max, Some(120.0));
        assert_eq!(rule.alert_message, "");
    }

    #[test]
    fn unknown_rule_type_is_invalid_row() {
        let err = AlertRule::try_from(row("SEASONAL")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow { rule_id: 7, .. }));
    }

    fn pg_config() -> PostgresConfig {
        PostgresConfig {
            host: "127.0.0.1".into(),
            port: 1,
            database: "vitalwatch".into(),
            username: Some("vw".into()),
            password: None,
            ssl_mode: "disable".into(),
            max_connections: 2,
        }
    }

    #[tokio::test]
    async fn lazy_connect_does_not_touch_network() {
        let store = PgRuleStore::connect_lazy(&pg_config()).unwrap();
        assert_eq!(store.name(), "postgres");
    }

    #[tokio::test]
    async fn password_with_url_delimiters_is_accepted() {
        let config = PostgresConfig {
            host: "db.internal".into(),
            password: Some("p@ss/w:rd?#".into()),
            ..pg_config()
        };
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 1);
        assert_eq!(options.get_username(), "vw");
        assert_eq!(options.get_database(), Some("vitalwatch"));
        assert!(PgRuleStore::connect_lazy(&config).is_ok());
    }

    #[test]
    fn unknown_ssl_mode_is_rejected() {
        let config = PostgresConfig {
            ssl_mode: "sometimes".into(),
            ..pg_config()
        };
        assert!(matches!(connect_options(&config), Err(StoreError::Database(_))));
    }
}
