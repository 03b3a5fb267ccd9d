//! Number brokerage backend service.
//!
//! Foreground: smart router + operational HTTP surface. Background: the
//! catalog sync scheduler with per-vendor isolated workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use numbroker_backend::api::{build_router, AppState};
use numbroker_backend::config::AppConfig;
use numbroker_backend::contracts::{EnvSettings, FixedRateSource, StorageAudit};
use numbroker_backend::health::{HealthConfig, HealthMetrics, HealthMonitor};
use numbroker_backend::index::HttpSearchIndex;
use numbroker_backend::providers::{DynamicAdapter, Provider};
use numbroker_backend::registry::CanonicalRegistry;
use numbroker_backend::router::{ProviderFactory, RouterConfig, SmartRouter};
use numbroker_backend::storage::{KvStore, SqliteKv, Storage};
use numbroker_backend::sync::icons::IconReconciler;
use numbroker_backend::sync::{Scheduler, SchedulerConfig, SyncConfig, Synchronizer};

#[derive(Debug, Parser)]
#[command(name = "numbroker", about = "Multi-provider SMS number brokerage core")]
struct Cli {
    /// Run one full catalog sync and exit instead of serving.
    #[arg(long)]
    sync_once: bool,

    /// With --sync-once: restrict the run to one vendor slug.
    #[arg(long)]
    vendor: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "numbroker_backend=info,numbroker=info,tower_http=warn",
            )
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    info!(bind_addr = %config.bind_addr, "starting numbroker backend");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("creating data directory")?;
    }
    std::fs::create_dir_all(&config.icon_dir).context("creating icon directory")?;

    let storage = Arc::new(Storage::open(&config.database_path)?);
    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&config.kv_path)?);
    let registry = Arc::new(CanonicalRegistry::new(
        storage.clone(),
        config.icon_dir.clone(),
    ));
    let index = Arc::new(HttpSearchIndex::new(
        &config.search_index_url,
        config.search_index_key.clone(),
    )?);

    let metrics = Arc::new(HealthMetrics::new());
    let health = Arc::new(HealthMonitor::new(
        kv.clone(),
        HealthConfig::default(),
        metrics.clone(),
    ));

    let factory: ProviderFactory = {
        let registry = registry.clone();
        Arc::new(move |vendor| {
            let adapter: Arc<dyn Provider> =
                Arc::new(DynamicAdapter::new(vendor.clone(), registry.clone())?);
            Ok(adapter)
        })
    };

    let rates = Arc::new(FixedRateSource::from_env()?);
    let settings = Arc::new(EnvSettings::from_env());
    let audit = Arc::new(StorageAudit::new(storage.clone()));
    let shutdown = Arc::new(AtomicBool::new(false));

    let synchronizer = Arc::new(Synchronizer::new(
        storage.clone(),
        registry.clone(),
        index.clone(),
        kv.clone(),
        rates.clone(),
        settings,
        audit,
        factory.clone(),
        SyncConfig {
            price_fanout_concurrency: config.price_fanout_concurrency,
            price_requests_per_minute: config.price_requests_per_minute,
            ..SyncConfig::default()
        },
        shutdown.clone(),
    ));

    let icons = Arc::new(IconReconciler::new(
        config.icon_dir.clone(),
        config.known_bad_icon_hashes.clone(),
    )?);
    let scheduler = Arc::new(Scheduler::new(
        synchronizer.clone(),
        storage.clone(),
        index.clone(),
        rates,
        icons,
        SchedulerConfig {
            interval: config.sync_interval,
            run_on_start: config.sync_on_start,
            vendor_filter: cli.vendor.clone().or_else(|| config.sync_provider.clone()),
        },
        shutdown.clone(),
    ));

    if cli.sync_once {
        let reports = scheduler.full_sync().await;
        for report in &reports {
            info!(vendor = %report.vendor, status = ?report.status, "sync report");
        }
        return Ok(());
    }

    let router = Arc::new(SmartRouter::new(
        storage.clone(),
        kv,
        health.clone(),
        index,
        factory,
        RouterConfig::default(),
    ));

    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let state = AppState {
        storage,
        router,
        sync: synchronizer,
        health,
        metrics,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("listening on {}", config.bind_addr);

    let shutdown_flag = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => warn!("failed listening for shutdown signal: {}", e),
            }
            shutdown_flag.store(true, Ordering::Relaxed);
        })
        .await
        .context("serving HTTP")?;

    // Pending scheduler waits are canceled by the flag; an in-flight sync
    // finishes on its worker thread.
    if let Err(e) = scheduler_task.await {
        warn!("scheduler task ended abnormally: {}", e);
    }
    info!("shutdown complete");
    Ok(())
}
