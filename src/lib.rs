//! Custody Engine - withdrawal and transfer orchestration
//!
//! Moves funds out of custodial hot wallets through an external processing
//! engine, on a schedule and on demand.
//!
//! # Modules
//!
//! - [`core_types`] - Ids and the [`Blockchain`] enum with address validation
//! - [`models`] - Users, currencies, addresses, withdrawal wallets, transfers
//! - [`lock`] - Per-blockchain sweep locks
//! - [`worker_pool`] - Bounded fan-out for bulk engine calls
//! - [`processing`] - Processing engine client, outcome classification
//! - [`rates`] - USD conversion
//! - [`storage`] - Persistence trait with PostgreSQL and in-memory backends
//! - [`wallet`] - Hot wallet address pool
//! - [`withdrawal`] - Scheduler, sweeps, processing withdrawal queue
//! - [`config`] / [`logging`] - Process setup

pub mod config;
pub mod core_types;
pub mod lock;
pub mod logging;
pub mod models;
pub mod processing;
pub mod rates;
pub mod storage;
pub mod wallet;
pub mod withdrawal;
pub mod worker_pool;

pub use core_types::{Blockchain, CurrencyId, OwnerId, StoreId, TransferId, UserId};
pub use lock::{BlockchainLockGuard, BlockchainLockRegistry};
pub use processing::{EngineError, HttpProcessingClient, Outcome, ProcessingClient};
pub use storage::{Storage, StorageTx, StoreError};
pub use wallet::WalletAddressPool;
pub use withdrawal::{
    CycleReport, ProcessingWithdrawalQueue, SchedulerConfig, Sweeper, TransferInitiator,
    WithdrawalError, WithdrawalScheduler,
};
pub use worker_pool::BoundedPool;
