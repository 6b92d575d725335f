//! Withdrawal orchestration
//!
//! - [`scheduler`]: the periodic loop
//! - [`queue`]: merchant withdrawals from the processing wallet
//! - [`sweep`]: hot address sweeps, single and multi-address
//! - [`rule`] / [`destination`]: where swept funds go
//! - [`initiator`]: one engine call plus its transfer record
//! - [`addresses`]: approved destinations and rules

pub mod addresses;
pub mod destination;
pub mod error;
pub mod initiator;
pub mod queue;
pub mod rule;
pub mod scheduler;
pub mod sweep;


pub use addresses::WithdrawalAddressBook;
pub use destination::DestinationPicker;
pub use error::WithdrawalError;
pub use initiator::{TransferDto, TransferInitiator};
pub use queue::{EnqueueRequest, ProcessingWithdrawalQueue};
pub use rule::{RuleResolver, parse_mode, validate_rule};
pub use scheduler::{SchedulerConfig, WithdrawalScheduler};
pub use sweep::Sweeper;

use crate::models::Transfer;

/// Per-cycle counters of a drain or sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Engine accepted the transfer
    pub initiated: usize,
    /// Recorded as a failed transfer
    pub failed: usize,
    /// Transient condition, eligible again next tick
    pub deferred: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl CycleReport {
    pub fn record(&mut self, result: &Result<Transfer, WithdrawalError>) {
        match result {
            Ok(transfer) if transfer.status.is_failed() => self.failed += 1,
            Ok(_) => self.initiated += 1,
            Err(e) if e.is_expected() => self.skipped += 1,
            Err(e) if e.is_retryable() => self.deferred += 1,
            Err(_) => self.errors += 1,
        }
    }

    pub fn merge(&mut self, other: CycleReport) {
        self.initiated += other.initiated;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    /// Transfers written this cycle, failed ones included
    pub fn transfers(&self) -> usize {
        self.initiated + self.failed
    }
}
