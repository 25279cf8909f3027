//! Tripwire Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - TRIPWIRE_HOST: Bind address (default: 0.0.0.0)
//! - TRIPWIRE_PORT: Port number (default: 8080)
//! - TRIPWIRE_JOURNAL_PATH: Write-ahead journal file (default: none, memory only)
//! - TRIPWIRE_MAX_ATTEMPTS: Attempts per queue item (default: 3)
//! - TRIPWIRE_DEFAULT_PRIORITY: Priority when none is given (default: 5)
//! - TRIPWIRE_LEASE_TTL_SECS: Claim lease length, 0 disables (default: 300)
//! - TRIPWIRE_QUEUE_RETENTION_DAYS: Terminal queue item retention (default: 30)
//! - TRIPWIRE_METRICS_RETENTION_DAYS: Metric retention (default: 90)
//! - TRIPWIRE_MAINTENANCE_INTERVAL_SECS: Sweep/reclaim interval (default: 60)
//! - TRIPWIRE_SCHEDULER_INTERVAL_SECS: Scheduled enqueue interval (default: 15)
//! - TRIPWIRE_HEALTH_CACHE_SECS: Health endpoint cache (default: 5)
//! - TRIPWIRE_ACCESS_POLICY: allow_all or owner_only (default: allow_all)
//! - RUST_LOG: Log level (default: info)

use tripwire::api::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripwire=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    tracing::info!("Tripwire configuration:");
    tracing::info!("  Host: {}:{}", config.host, config.port);
    match &config.journal_path {
        Some(path) => tracing::info!("  Journal: {}", path.display()),
        None => tracing::info!("  Journal: DISABLED (memory only)"),
    }
    tracing::info!("  Max attempts: {}", config.queue.max_attempts);
    tracing::info!("  Default priority: {}", config.queue.default_priority);
    match config.queue.lease_ttl {
        Some(ttl) => tracing::info!("  Lease TTL: {} seconds", ttl.as_secs()),
        None => tracing::info!("  Lease TTL: DISABLED"),
    }
    tracing::info!(
        "  Retention: queue {} days, metrics {} days",
        config.retention.queue_retention.as_secs() / 86_400,
        config.retention.metrics_retention.as_secs() / 86_400
    );
    tracing::info!(
        "  Maintenance interval: {} seconds",
        config.maintenance_interval.as_secs()
    );
    tracing::info!(
        "  Scheduler interval: {} seconds",
        config.scheduler_interval.as_secs()
    );
    tracing::info!("  Access policy: {:?}", config.access);

    println!(
        r#"
  _____     _                _
 |_   _| __(_)_ ____      __(_)_ __ ___
   | || '__| | '_ \ \ /\ / /| | '__/ _ \
   | || |  | | |_) \ V  V / | | | |  __/
   |_||_|  |_| .__/ \_/\_/  |_|_|  \___|
             |_|

 Alert Evaluation Coordinator
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(config).await
}
