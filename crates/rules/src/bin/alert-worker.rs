//! alert-worker — evaluates telemetry batches against cached tenant rules.
//!
//! Subscribes to:
//! - `{prefix}.telemetry.batch` — batches to evaluate
//! - `{prefix}.rules.invalidated` — rule changes (via the rule cache listener)
//!
//! Publishes:
//! - `{prefix}.alerts.raised` — alert candidates per evaluated batch
//!
//! The `invalidate`, `preload` and `stats` subcommands are operator tools
//! against the same shared tier and broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use vitalwatch_cache::ValueCache;
use vitalwatch_core::config::{self, Config};
use vitalwatch_core::{InvalidationScope, TenantId};
use vitalwatch_eisenbahn::events::{AlertsRaised, TelemetryBatch};
use vitalwatch_eisenbahn::{
    topics, EisenbahnError, EventBus, EventPublisher, EventSubscriber, Message, RedisBus,
};
use vitalwatch_rules::manager::TENANTS_KEY;
use vitalwatch_rules::{AlertEvaluationEngine, PgRuleStore, RuleCache, RuleCacheManager};

// ── CLI ─────────────────────────────────────────────────────────────

/// Alert worker: rule caching and telemetry threshold evaluation.
#[derive(Parser, Debug)]
#[command(name = "alert-worker", version, about)]
struct Cli {
    /// Config profile; keys are read as `{PROFILE}_{KEY}` first.
    #[arg(long, env = "VITALWATCH_PROFILE", global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume telemetry batches and publish alert candidates.
    Run {
        /// Tenants to warm at startup. Defaults to every tenant in the shared tier.
        #[arg(long = "tenant", value_delimiter = ',')]
        tenants: Vec<TenantId>,

        /// Seconds between stats log lines.
        #[arg(long, env = "ALERT_WORKER_STATS_INTERVAL", default_value_t = 30)]
        stats_interval: u64,
    },

    /// Drop cached rules and notify every worker.
    Invalidate {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        tenant: Option<TenantId>,

        /// Invalidate every tenant.
        #[arg(long)]
        all: bool,

        #[arg(long, default_value = "manual invalidation")]
        reason: String,
    },

    /// Warm both cache tiers for the given tenants.
    Preload {
        #[arg(long = "tenant", value_delimiter = ',', required = true)]
        tenants: Vec<TenantId>,
    },

    /// Print config, shared-tier liveness and cached tenants as JSON.
    Stats,
}

// ── Wiring ──────────────────────────────────────────────────────────

struct Components {
    cache: Arc<ValueCache>,
    bus: Arc<dyn EventBus>,
    manager: Arc<RuleCacheManager>,
}

async fn connect(config: &Config) -> anyhow::Result<Components> {
    let cache = ValueCache::connect(&config.redis)
        .await
        .context("invalid redis configuration")?;
    let bus: Arc<dyn EventBus> = Arc::new(
        RedisBus::open(&config.redis.url, config.redis.connect_timeout())
            .context("invalid broker configuration")?,
    );
    let store = Arc::new(PgRuleStore::connect_lazy(&config.postgres).context("invalid postgres configuration")?);
    let manager = Arc::new(RuleCacheManager::new(
        cache.clone(),
        store,
        bus.clone(),
        &config.rule_cache,
    ));
    Ok(Components { cache, bus, manager })
}

async fn known_tenants(cache: &ValueCache) -> Vec<TenantId> {
    let mut tenants: Vec<TenantId> = cache
        .smembers(TENANTS_KEY)
        .await
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    tenants.sort_unstable();
    tenants
}

// ── AlertWorker ─────────────────────────────────────────────────────

struct AlertWorker {
    engine: AlertEvaluationEngine,
    manager: Arc<RuleCacheManager>,
    bus: Arc<dyn EventBus>,
    publisher: Mutex<Option<Arc<dyn EventPublisher>>>,
    batch_topic: String,
    alerts_topic: String,
    shutdown: Arc<Notify>,
}

impl AlertWorker {
    fn new(components: &Components, shutdown: Arc<Notify>) -> Self {
        let prefix = components.cache.prefix();
        Self {
            engine: AlertEvaluationEngine::new(components.manager.clone() as Arc<dyn RuleCache>),
            manager: components.manager.clone(),
            bus: components.bus.clone(),
            publisher: Mutex::new(None),
            batch_topic: topics::namespaced(prefix, topics::TELEMETRY_BATCH),
            alerts_topic: topics::namespaced(prefix, topics::ALERTS_RAISED),
            shutdown,
        }
    }

    /// Cached publisher, reconnected after a failed publish.
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        let mut slot = self.publisher.lock().await;
        let publisher = match slot.as_ref() {
            Some(p) => p.clone(),
            None => {
                let p = self.bus.publisher().await?;
                *slot = Some(p.clone());
                p
            }
        };
        let result = publisher.publish(message).await;
        if result.is_err() {
            slot.take();
        }
        result
    }

    async fn handle_batch(&self, msg: Message) -> Result<(), EisenbahnError> {
        if msg.topic != self.batch_topic {
            warn!(topic = %msg.topic, "unexpected event topic");
            return Ok(());
        }
        let batch: TelemetryBatch = msg.decode()?;
        let started = Instant::now();
        let candidates = self.engine.generate_alerts(&batch.records).await;

        info!(
            batch_id = %batch.batch_id,
            records = batch.records.len(),
            alerts = candidates.len(),
            "telemetry batch evaluated"
        );
        if candidates.is_empty() {
            return Ok(());
        }

        let raised = AlertsRaised {
            batch_id: batch.batch_id,
            candidates,
            evaluated_records: batch.records.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.publish(Message::new(&self.alerts_topic, &raised)?).await
    }

    async fn log_stats(&self) {
        let engine = self.engine.get_stats();
        let cache = self.manager.stats().await;
        info!(
            processed = engine.total_processed,
            alerts = engine.alerts_generated,
            skipped = engine.skipped_records,
            hit_rate = %format!("{:.3}", engine.cache_hit_rate),
            avg_ms = %format!("{:.3}", engine.avg_processing_time_ms),
            local_entries = cache.local_entries,
            invalidations = cache.invalidations,
            healthy = engine.connection_health,
            "alert worker stats"
        );
    }

    /// Consume telemetry until shutdown, reconnecting after broker errors.
    async fn run_loop(self: &Arc<Self>, stats_interval: Duration) {
        let mut stats_tick = tokio::time::interval(stats_interval);
        stats_tick.tick().await;

        'connect: loop {
            let subscriber = match self.bus.subscriber().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "telemetry subscribe failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue 'connect,
                        _ = self.shutdown.notified() => break 'connect,
                    }
                }
            };
            if let Err(e) = subscriber.subscribe(&self.batch_topic).await {
                warn!(error = %e, "telemetry subscribe failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            info!(topic = %self.batch_topic, "consuming telemetry batches");

            loop {
                tokio::select! {
                    result = subscriber.recv() => match result {
                        Ok(msg) => {
                            if let Err(e) = self.handle_batch(msg).await {
                                error!(error = %e, "failed to handle telemetry batch");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "telemetry subscriber recv error");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue 'connect;
                        }
                    },
                    _ = stats_tick.tick() => self.log_stats().await,
                    _ = self.shutdown.notified() => break 'connect,
                }
            }
        }
        info!("alert worker event loop shutting down");
    }
}

// ── Commands ────────────────────────────────────────────────────────

async fn run(config: &Config, tenants: Vec<TenantId>, stats_interval: u64) -> anyhow::Result<()> {
    let components = connect(config).await?;

    let tenants = if tenants.is_empty() {
        known_tenants(&components.cache).await
    } else {
        tenants
    };
    if !tenants.is_empty() {
        components.manager.preload(&tenants).await;
    }
    components.manager.start_subscriber().await;

    let shutdown = Arc::new(Notify::new());
    let worker = Arc::new(AlertWorker::new(&components, shutdown.clone()));
    let worker_for_loop = worker.clone();
    let event_loop = tokio::spawn(async move {
        worker_for_loop
            .run_loop(Duration::from_secs(stats_interval.max(1)))
            .await;
    });

    info!("alert-worker running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    shutdown.notify_one();
    if let Err(e) = event_loop.await {
        warn!(error = %e, "event loop ended abnormally");
    }
    worker.log_stats().await;
    components.manager.stop_subscriber().await;
    components.cache.shutdown().await;
    info!("alert-worker exited cleanly");
    Ok(())
}

async fn invalidate(config: &Config, tenant: Option<TenantId>, reason: &str) -> anyhow::Result<()> {
    let components = connect(config).await?;
    let scope = tenant.map_or(InvalidationScope::All, InvalidationScope::Tenant);
    components
        .manager
        .invalidate(scope, reason)
        .await
        .context("failed to publish invalidation")?;
    println!("invalidated {scope}");
    components.cache.shutdown().await;
    Ok(())
}

async fn preload(config: &Config, tenants: &[TenantId]) -> anyhow::Result<()> {
    let components = connect(config).await?;
    let report = components.manager.preload(tenants).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    components.cache.shutdown().await;
    Ok(())
}

/// Cluster-level view only. A freshly connected client has no counters worth
/// reporting; per-process counters are logged by `run`.
fn stats_report(config: &Config, reachable: bool, tenants: &[TenantId]) -> serde_json::Value {
    serde_json::json!({
        "config": config.redacted_summary(),
        "profiles": Config::available_profiles(),
        "shared_tier_reachable": reachable,
        "cached_tenants": tenants,
    })
}

async fn stats(config: &Config) -> anyhow::Result<()> {
    let components = connect(config).await?;
    let reachable = components.cache.ping().await;
    let tenants = known_tenants(&components.cache).await;
    let out = stats_report(config, reachable, &tenants);
    println!("{}", serde_json::to_string_pretty(&out)?);
    components.cache.shutdown().await;
    Ok(())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    config::load_dotenv();
    let cli = Cli::parse();
    let config = match cli.profile.as_deref() {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    config.log_summary();

    match cli.command {
        Command::Run { tenants, stats_interval } => run(&config, tenants, stats_interval).await,
        Command::Invalidate { tenant, all: _, reason } => invalidate(&config, tenant, &reason).await,
        Command::Preload { tenants } => preload(&config, &tenants).await,
        Command::Stats => stats(&config).await,
    }
}
