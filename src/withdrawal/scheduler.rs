//! Withdrawal Scheduler
//!
//! Every tick, in order:
//! 1. drain the processing withdrawal queue
//! 2. run multi-address consolidations
//! 3. spawn one sweep task per configured blockchain
//!
//! Steps 1 and 2 run inline. Sweep tasks run concurrently across
//! blockchains, each guarded by the [`BlockchainLockRegistry`]; a chain still
//! busy from an earlier tick is skipped. On shutdown the loop stops ticking
//! and waits for running sweeps, which stop between wallets.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::CycleReport;
use super::queue::ProcessingWithdrawalQueue;
use super::sweep::Sweeper;
use crate::core_types::Blockchain;
use crate::lock::BlockchainLockRegistry;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub blockchains: Vec<Blockchain>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_TICK_INTERVAL,
            blockchains: Blockchain::ALL.to_vec(),
        }
    }
}

pub struct WithdrawalScheduler {
    config: SchedulerConfig,
    locks: Arc<BlockchainLockRegistry>,
    queue: Arc<ProcessingWithdrawalQueue>,
    sweeper: Arc<Sweeper>,
}

impl WithdrawalScheduler {
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<ProcessingWithdrawalQueue>,
        sweeper: Arc<Sweeper>,
    ) -> Self {
        Self {
            config,
            locks: Arc::new(BlockchainLockRegistry::new()),
            queue,
            sweeper,
        }
    }

    pub fn locks(&self) -> &Arc<BlockchainLockRegistry> {
        &self.locks
    }

    /// Tick until `shutdown` turns true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps = JoinSet::new();

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            blockchains = self.config.blockchains.len(),
            "Withdrawal scheduler started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_inline(&shutdown).await;
                    self.spawn_sweeps(&mut sweeps, &shutdown);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            while let Some(joined) = sweeps.try_join_next() {
                reap(joined);
            }
        }

        if !sweeps.is_empty() {
            info!(running = sweeps.len(), "Waiting for sweeps to finish");
        }
        while let Some(joined) = sweeps.join_next().await {
            reap(joined);
        }
        info!("Withdrawal scheduler stopped");
    }

    /// One full tick, waiting for every sweep it started
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let mut report = self.run_inline(shutdown).await;
        let mut sweeps = JoinSet::new();
        self.spawn_sweeps(&mut sweeps, shutdown);
        while let Some(joined) = sweeps.join_next().await {
            if let Some(sweep) = reap(joined) {
                report.merge(sweep);
            }
        }
        report
    }

    async fn run_inline(&self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::default();

        match self.queue.drain().await {
            Ok(drained) => report.merge(drained),
            Err(e) => error!(error = %e, code = e.code(), "Processing withdrawal drain failed"),
        }
        if *shutdown.borrow() {
            return report;
        }

        match self.sweeper.run_multi_withdrawals().await {
            Ok(multi) => report.merge(multi),
            Err(e) => error!(error = %e, code = e.code(), "Multi-withdrawal pass failed"),
        }
        report
    }

    fn spawn_sweeps(
        &self,
        sweeps: &mut JoinSet<Option<CycleReport>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }
        for &blockchain in &self.config.blockchains {
            let locks = Arc::clone(&self.locks);
            let sweeper = Arc::clone(&self.sweeper);
            let shutdown = shutdown.clone();
            sweeps.spawn(async move {
                let Some(_guard) = locks.try_acquire(blockchain) else {
                    debug!(blockchain = %blockchain, "Sweep still running, skipping tick");
                    return None;
                };
                match sweeper.sweep_blockchain(blockchain, &shutdown).await {
                    Ok(report) => {
                        if report.transfers() > 0 {
                            info!(
                                blockchain = %blockchain,
                                initiated = report.initiated,
                                failed = report.failed,
                                deferred = report.deferred,
                                "Blockchain swept"
                            );
                        }
                        Some(report)
                    }
                    Err(e) => {
                        error!(blockchain = %blockchain, error = %e, code = e.code(), "Blockchain sweep failed");
                        None
                    }
                }
            });
        }
    }
}

fn reap(
    joined: Result<Option<CycleReport>, tokio::task::JoinError>,
) -> Option<CycleReport> {
    match joined {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Sweep task aborted");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.blockchains.len(), Blockchain::ALL.len());
    }
}
