use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    alert_queue, alert_triggers, claim, create_alert, delete_alert, enqueue, get_alert,
    get_queue_item, get_trigger, health_check, health_snapshot, list_alerts, observe,
    queue_counts, reclaim, record_metric, report_outcome, resolve_trigger, sweep, update_alert,
    AppState,
};
use crate::alerts::{AccessPolicy, AllowAll, OwnerOnly};
use crate::maintenance::{EvaluationScheduler, MaintenanceWorker, RetentionConfig};
use crate::metrics::HealthConfig;
use crate::queue::QueueConfig;
use crate::storage::{FileJournal, Journal};

/// Which alerts a caller may read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    AllowAll,
    OwnerOnly,
}

impl AccessMode {
    pub fn policy(&self) -> Arc<dyn AccessPolicy> {
        match self {
            AccessMode::AllowAll => Arc::new(AllowAll),
            AccessMode::OwnerOnly => Arc::new(OwnerOnly),
        }
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow_all" => Ok(AccessMode::AllowAll),
            "owner_only" => Ok(AccessMode::OwnerOnly),
            other => Err(format!("unknown access policy '{}'", other)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Write-ahead journal; state is memory-only when unset
    pub journal_path: Option<PathBuf>,
    pub queue: QueueConfig,
    pub retention: RetentionConfig,
    pub health: HealthConfig,
    pub access: AccessMode,
    pub maintenance_interval: Duration,
    pub scheduler_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            journal_path: None,
            queue: QueueConfig::default(),
            retention: RetentionConfig::default(),
            health: HealthConfig::default(),
            access: AccessMode::AllowAll,
            maintenance_interval: Duration::from_secs(60),
            scheduler_interval: Duration::from_secs(15),
        }
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

impl ServerConfig {
    /// Read `TRIPWIRE_*` environment variables over the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| -> Option<u64> { parse_var(&lookup, key) };

        let lease_ttl = match parse("TRIPWIRE_LEASE_TTL_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.queue.lease_ttl,
        };

        let queue = QueueConfig::default()
            .with_max_attempts(
                parse_var(&lookup, "TRIPWIRE_MAX_ATTEMPTS").unwrap_or(defaults.queue.max_attempts),
            )
            .with_default_priority(
                parse_var(&lookup, "TRIPWIRE_DEFAULT_PRIORITY")
                    .unwrap_or(defaults.queue.default_priority),
            )
            .with_lease_ttl(lease_ttl);

        let days = |key: &str| {
            let days = parse(key)?;
            let secs = days.checked_mul(DAY_SECS);
            if secs.is_none() {
                tracing::warn!("Ignoring out-of-range value '{}' for {}", days, key);
            }
            secs.map(Duration::from_secs)
        };

        let mut retention = RetentionConfig::default();
        if let Some(horizon) = days("TRIPWIRE_QUEUE_RETENTION_DAYS") {
            retention = retention.with_queue_retention(horizon);
        }
        if let Some(horizon) = days("TRIPWIRE_METRICS_RETENTION_DAYS") {
            retention = retention.with_metrics_retention(horizon);
        }

        let mut health = HealthConfig::default();
        if let Some(secs) = parse("TRIPWIRE_HEALTH_CACHE_SECS") {
            health = health.with_cache_ttl(Duration::from_secs(secs));
        }

        let interval = |key: &str, default: Duration| match parse(key) {
            Some(0) => {
                tracing::warn!("{} must be positive, using {:?}", key, default);
                default
            }
            Some(secs) => Duration::from_secs(secs),
            None => default,
        };

        Self {
            host: lookup("TRIPWIRE_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "TRIPWIRE_PORT").unwrap_or(defaults.port),
            journal_path: lookup("TRIPWIRE_JOURNAL_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            queue,
            retention,
            health,
            access: parse_var(&lookup, "TRIPWIRE_ACCESS_POLICY").unwrap_or(defaults.access),
            maintenance_interval: interval(
                "TRIPWIRE_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            ),
            scheduler_interval: interval(
                "TRIPWIRE_SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval,
            ),
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value '{}' for {}", raw, key);
            None
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(health_check))
        .route("/health/snapshot", get(health_snapshot))
        // Alerts
        .route("/alerts", get(list_alerts).post(create_alert))
        .route(
            "/alerts/:id",
            get(get_alert).put(update_alert).delete(delete_alert),
        )
        .route("/alerts/:id/queue", get(alert_queue))
        .route("/alerts/:id/triggers", get(alert_triggers))
        // Queue
        .route("/queue", get(queue_counts).post(enqueue))
        .route("/queue/claim", post(claim))
        .route("/queue/:id", get(get_queue_item))
        .route("/queue/:id/outcome", post(report_outcome))
        // Triggers
        .route("/triggers/observe", post(observe))
        .route("/triggers/:id", get(get_trigger))
        .route("/triggers/:id/resolve", post(resolve_trigger))
        // Metrics & maintenance
        .route("/metrics", post(record_metric))
        .route("/maintenance/sweep", post(sweep))
        .route("/maintenance/reclaim", post(reclaim))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Replay the journal before reopening it for appends
    let (journal, recovered) = match &config.journal_path {
        Some(path) => {
            let recovered = FileJournal::replay(path)?;
            let journal: Arc<dyn Journal> = Arc::new(FileJournal::open(path)?);
            tracing::info!("Journaling to {}", path.display());
            (Some(journal), Some(recovered))
        }
        None => {
            tracing::warn!("No journal configured; state will not survive a restart");
            (None, None)
        }
    };

    let state = Arc::new(AppState::from_config(&config, journal.clone()));
    if let Some(recovered) = recovered {
        state.restore(recovered);
    }

    // Start background workers
    let maintenance_worker = Arc::new(MaintenanceWorker::new(
        Arc::clone(&state.sweeper),
        Arc::clone(&state.leases),
        config.maintenance_interval,
    ));
    let maintenance_handle = Arc::clone(&maintenance_worker).start();

    let scheduler = Arc::new(EvaluationScheduler::new(
        state.registry.clone(),
        Arc::clone(&state.queue),
        config.scheduler_interval,
    ));
    let scheduler_handle = Arc::clone(&scheduler).start();

    // Build router
    let app = build_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Tripwire server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(maintenance_worker, scheduler))
        .await?;

    // Wait for workers to stop
    maintenance_handle.abort();
    scheduler_handle.abort();

    if let Some(journal) = journal {
        journal.sync()?;
    }

    tracing::info!("Tripwire server stopped");
    Ok(())
}

async fn shutdown_signal(
    maintenance_worker: Arc<MaintenanceWorker>,
    scheduler: Arc<EvaluationScheduler>,
) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");

    tracing::info!("Shutdown signal received, stopping workers...");
    maintenance_worker.stop();
    scheduler.stop();
}
