//! Assessment statistics service
//!
//! Runs the rollup synchronization and consistency validation jobs on a fixed
//! interval against the configured database until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use assessment_stats::cache::build_counter_cache;
use assessment_stats::config::{CacheBackend, Config};
use assessment_stats::jobs::{start_background_tasks, BatchOptions};
use assessment_stats::{
    Database, QueryGateway, RawAggregator, SqliteRollupStore, Synchronizer,
    Validator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;

    // RUST_LOG wins over the configured level; LOG_FORMAT=gcp wins over the configured format
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.logging.format.clone());
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting assessment statistics service...");

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let cache = build_counter_cache(&config.cache)?;
    match config.cache.backend {
        CacheBackend::Redis => info!("Using shared redis counter cache"),
        CacheBackend::Memory => warn!(
            "Using process-local counter cache; counters written by other processes are not visible"
        ),
    }
    let rollups = Arc::new(SqliteRollupStore::new(db.pool().clone()));
    let raw = RawAggregator::new(db.pool().clone());

    let gateway = QueryGateway::new(
        cache.clone(),
        rollups.clone(),
        raw.clone(),
        config.cache.snapshot_ttl(),
    );

    let shutdown = CancellationToken::new();

    // Warm the system snapshots so the first dashboard reads are cache hits
    warm_cache(&gateway, &raw, &shutdown).await;

    let options = BatchOptions::from(config.scheduler.clone());
    let sync = Arc::new(Synchronizer::new(
        cache.clone(),
        rollups.clone(),
        raw.clone(),
        options.clone(),
    ));
    let validator = Arc::new(Validator::new(cache, rollups, raw, options));

    let scheduler = start_background_tasks(sync, validator, &config.scheduler, shutdown.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    scheduler.await?;

    info!("Stopped");
    Ok(())
}

async fn warm_cache(gateway: &QueryGateway, raw: &RawAggregator, cancel: &CancellationToken) {
    let orgs = match raw.list_active_orgs().await {
        Ok(orgs) => orgs,
        Err(e) => {
            warn!(error = %e, "Skipping cache warm-up");
            return;
        }
    };
    for org_id in &orgs {
        if let Err(e) = gateway.get_system_statistics(cancel, *org_id).await {
            warn!(org_id, error = %e, "Failed to warm system statistics");
        }
    }
    info!(orgs = orgs.len(), "Cache warmed");
}
