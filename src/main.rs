//! Custody Engine - withdrawal scheduler process
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌────────────┐    ┌────────────┐
//! │  Config  │───▶│ Scheduler │───▶│ Initiator  │───▶│ Processing │
//! │  (YAML)  │    │  (tick)   │    │ (+storage) │    │   engine   │
//! └──────────┘    └───────────┘    └────────────┘    └────────────┘
//! ```
//!
//! Usage: `custody_engine [--env <name>]`, reads `config/<name>.yaml`.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;

use custody_engine::config::AppConfig;
use custody_engine::processing::HttpProcessingClient;
use custody_engine::rates::StaticRateProvider;
use custody_engine::storage::{MemoryStorage, PgStorage, Storage};
use custody_engine::wallet::ResourceMonitor;
use custody_engine::{
    BoundedPool, ProcessingClient, ProcessingWithdrawalQueue, Sweeper, TransferInitiator,
    WalletAddressPool, WithdrawalScheduler,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).context("Failed to load config")?;
    let _log_guard = custody_engine::logging::init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting custody engine"
    );

    let storage: Arc<dyn Storage> = match &app_config.postgres_url {
        Some(url) => {
            let pg = PgStorage::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            pg.health_check()
                .await
                .context("PostgreSQL health check failed")?;
            Arc::new(pg)
        }
        None => {
            tracing::warn!("postgres_url not set, using in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    };

    let engine: Arc<dyn ProcessingClient> = Arc::new(
        HttpProcessingClient::new(
            &app_config.processing.base_url,
            app_config.processing.timeout(),
        )
        .context("Failed to build processing client")?,
    );

    let mut rates = StaticRateProvider::new(app_config.rates.sources.clone());
    if let Some(source) = &app_config.rates.default_source {
        rates = rates.with_default_source(source);
    }
    let rates = Arc::new(rates);

    let pool = Arc::new(WalletAddressPool::new(
        storage.clone(),
        engine.clone(),
        app_config.address_hints.clone(),
    ));
    let initiator = Arc::new(TransferInitiator::new(storage.clone(), engine.clone()));
    let queue = Arc::new(ProcessingWithdrawalQueue::new(
        storage.clone(),
        engine.clone(),
        rates,
        initiator.clone(),
    ));
    let monitor = Arc::new(ResourceMonitor::new(
        storage.clone(),
        engine.clone(),
        BoundedPool::new(app_config.scheduler.worker_pool_cap),
        app_config.scheduler.resource_report_interval(),
    ));
    let sweeper = Arc::new(Sweeper::new(storage, engine, pool, initiator));
    let scheduler = Arc::new(WithdrawalScheduler::new(
        app_config.scheduler.scheduler_config(),
        queue,
        sweeper,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(shutdown_rx).await })
    };
    let handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    // Receivers outlive the send, an error only means the scheduler is gone
    let _ = shutdown_tx.send(true);
    handle.await.context("Scheduler task panicked")?;
    monitor_handle
        .await
        .context("Resource monitor task panicked")?;

    tracing::info!("Custody engine stopped");
    Ok(())
}
