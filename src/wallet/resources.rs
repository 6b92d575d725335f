//! Aggregated engine resources (energy, bandwidth) across owner wallets

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::core_types::{Blockchain, OwnerId};
use crate::processing::ProcessingClient;
use crate::storage::{Storage, StoreError};
use crate::worker_pool::BoundedPool;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStats {
    /// Owners that answered
    pub owners: usize,
    pub energy: u64,
    pub bandwidth: u64,
    /// Owners whose lookup failed
    pub failed: usize,
}

/// Fan out `get_owner_resources` through the bounded pool and sum the results
pub async fn collect_resource_stats(
    engine: Arc<dyn ProcessingClient>,
    pool: &BoundedPool,
    owners: Vec<OwnerId>,
    blockchain: Blockchain,
) -> ResourceStats {
    let results = pool
        .run_all(owners, |owner_id| {
            let engine = Arc::clone(&engine);
            async move {
                let result = engine.get_owner_resources(owner_id, blockchain).await;
                (owner_id, result)
            }
        })
        .await;

    results
        .into_iter()
        .fold(ResourceStats::default(), |mut stats, (owner_id, result)| {
            match result {
                Ok(resources) => {
                    stats.owners += 1;
                    stats.energy = stats.energy.saturating_add(resources.energy);
                    stats.bandwidth = stats.bandwidth.saturating_add(resources.bandwidth);
                }
                Err(e) => {
                    warn!(owner_id = %owner_id, blockchain = %blockchain, error = %e, "Failed to load owner resources");
                    stats.failed += 1;
                }
            }
            stats
        })
}

/// Periodic owner resource report for chains whose transfers are paid from
/// staked resources
pub struct ResourceMonitor {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ProcessingClient>,
    pool: BoundedPool,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ProcessingClient>,
        pool: BoundedPool,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            engine,
            pool,
            interval,
        }
    }

    /// One pass over every processing owner
    pub async fn collect(&self) -> Result<Vec<(Blockchain, ResourceStats)>, StoreError> {
        let owners = self.storage.get_processing_owner_ids().await?;
        let mut report = Vec::new();
        for blockchain in Blockchain::ALL
            .into_iter()
            .filter(Blockchain::requires_transfer_kind_hint)
        {
            let stats =
                collect_resource_stats(Arc::clone(&self.engine), &self.pool, owners.clone(), blockchain)
                    .await;
            info!(
                blockchain = %blockchain,
                owners = stats.owners,
                energy = stats.energy,
                bandwidth = stats.bandwidth,
                failed = stats.failed,
                "Owner resources"
            );
            report.push((blockchain, stats));
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            cap = self.pool.cap(),
            "Resource monitor started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        error!(error = %e, code = e.code(), "Owner resource pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Resource monitor stopped");
    }
}
