use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub redis: RedisConfig,
    pub rule_cache: RuleCacheConfig,
    pub postgres: PostgresConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &["REDIS_URL", "PG_HOST", "CACHE_KEY_PREFIX"];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `VITALWATCH_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("VITALWATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            redis: RedisConfig::from_env_profiled(p),
            rule_cache: RuleCacheConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  redis:       url={}, prefix={}, pool={}",
            self.redis.redacted_url(),
            self.redis.key_prefix,
            self.redis.pool_size
        );
        tracing::info!(
            "  rule_cache:  shared_ttl={}s, local_ttl={}s, capacity={}, serializer={}",
            self.rule_cache.shared_ttl_secs,
            self.rule_cache.local_ttl_secs,
            self.rule_cache.local_capacity,
            self.rule_cache.serializer
        );
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
    }

    /// Return a redacted view safe for status output (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "redis": {
                "url": self.redis.redacted_url(),
                "key_prefix": self.redis.key_prefix,
                "pool_size": self.redis.pool_size,
                "op_timeout_ms": self.redis.op_timeout_ms,
            },
            "rule_cache": {
                "shared_ttl_secs": self.rule_cache.shared_ttl_secs,
                "local_ttl_secs": self.rule_cache.local_ttl_secs,
                "local_capacity": self.rule_cache.local_capacity,
                "serializer": self.rule_cache.serializer,
            },
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
        })
    }
}

// ── Redis (shared cache + broker) ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every key and channel, so several deployments can share one Redis.
    pub key_prefix: String,
    pub pool_size: u32,
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
    pub health_check_interval_secs: u64,
}

impl RedisConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "REDIS_URL", "redis://127.0.0.1:6379/0"),
            key_prefix: profiled_env_or(p, "CACHE_KEY_PREFIX", "vitalwatch"),
            pool_size: profiled_env_u32(p, "REDIS_POOL_SIZE", 4).max(1),
            connect_timeout_ms: profiled_env_u64(p, "REDIS_CONNECT_TIMEOUT_MS", 2_000),
            op_timeout_ms: profiled_env_u64(p, "CACHE_OP_TIMEOUT_MS", 500),
            health_check_interval_secs: profiled_env_u64(p, "REDIS_HEALTH_CHECK_INTERVAL_SECS", 30),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// URL with any password replaced by `***`.
    pub fn redacted_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                let creds = &self.url[scheme_end + 3..at];
                let user = creds.split(':').next().unwrap_or("");
                format!("{}{}:***{}", &self.url[..scheme_end + 3], user, &self.url[at..])
            }
            _ => self.url.clone(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::from_env_profiled("")
    }
}

// ── Rule cache ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCacheConfig {
    /// TTL of rule snapshots in the shared tier.
    pub shared_ttl_secs: u64,
    /// How long a local entry is served before it is considered stale.
    pub local_ttl_secs: u64,
    /// Maximum tenants held in the process-local map.
    pub local_capacity: usize,
    pub store_timeout_ms: u64,
    pub warmup_lease_secs: u64,
    /// "structured", "opaque" or "raw".
    pub serializer: String,
    pub resubscribe_max_backoff_secs: u64,
    /// Bound on one invalidation subscribe attempt.
    pub subscribe_timeout_ms: u64,
}

impl RuleCacheConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            shared_ttl_secs: profiled_env_u64(p, "RULE_CACHE_TTL_SECS", 3_600),
            local_ttl_secs: profiled_env_u64(p, "RULE_LOCAL_TTL_SECS", 300),
            local_capacity: profiled_env_u32(p, "RULE_LOCAL_CAPACITY", 1_024).max(1) as usize,
            store_timeout_ms: profiled_env_u64(p, "RULE_STORE_TIMEOUT_MS", 2_000),
            warmup_lease_secs: profiled_env_u64(p, "RULE_WARMUP_LEASE_SECS", 30),
            serializer: profiled_env_or(p, "RULE_CACHE_SERIALIZER", "structured"),
            resubscribe_max_backoff_secs: profiled_env_u64(p, "RULE_RESUBSCRIBE_MAX_BACKOFF_SECS", 30),
            subscribe_timeout_ms: profiled_env_u64(p, "RULE_SUBSCRIBE_TIMEOUT_MS", 5_000),
        }
    }

    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_ttl_secs)
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn warmup_lease(&self) -> Duration {
        Duration::from_secs(self.warmup_lease_secs)
    }

    pub fn resubscribe_max_backoff(&self) -> Duration {
        Duration::from_secs(self.resubscribe_max_backoff_secs.max(1))
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms.max(1))
    }
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            shared_ttl_secs: 3_600,
            local_ttl_secs: 300,
            local_capacity: 1_024,
            store_timeout_ms: 2_000,
            warmup_lease_secs: 30,
            serializer: "structured".to_string(),
            resubscribe_max_backoff_secs: 30,
            subscribe_timeout_ms: 5_000,
        }
    }
}

// ── PostgreSQL (authoritative rule store) ─────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "vitalwatch"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}
