//! Withdrawal error types
//!
//! Three groups drive how callers react:
//! - expected: skip the unit of work quietly
//! - retryable: nothing was recorded, try again next tick
//! - everything else: logged by background loops, returned verbatim to API callers

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::core_types::{Blockchain, TransferId, UserId};
use crate::processing::{EngineError, RetryReason};
use crate::rates::RateError;
use crate::storage::StoreError;
use crate::wallet::PoolError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalError {
    // --- expected ---
    #[error("Transfers are disabled for the user")]
    TransfersDisabled,

    #[error("Withdrawal from processing is disabled for the user")]
    WithdrawalFromProcessingDisabled,

    #[error("Nothing to withdraw")]
    NothingToWithdraw,

    #[error("No approved withdrawal addresses")]
    EmptyApprovedAddresses,

    // --- retryable ---
    #[error("Retry later: {0}")]
    Retryable(RetryReason),

    #[error("Blockchain explorer unavailable: {0}")]
    ExplorerUnavailable(String),

    #[error("Address unavailable: {0}")]
    AddressUnavailable(String),

    // --- configuration ---
    #[error("Manual withdrawal address is not set")]
    ManualAddressNotSet,

    #[error("Manual withdrawal address {0} is not approved")]
    ManualAddressNotApproved(String),

    #[error("Address {0} is the manual withdrawal address of the rule")]
    ManualAddressInUse(String),

    #[error("Unknown multi-withdrawal mode: {0}")]
    UnknownRuleMode(String),

    #[error("User {0} has no processing owner")]
    NoProcessingOwner(UserId),

    // --- request validation ---
    #[error("Invalid {blockchain} address: {address}")]
    InvalidAddress {
        blockchain: Blockchain,
        address: String,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Duplicate request_id: {0}")]
    DuplicateRequest(String),

    /// Recorded as a failed transfer
    #[error("Transfer {transfer_id} failed: {message}")]
    TransferFailed {
        transfer_id: TransferId,
        message: String,
    },

    // --- wrapped ---
    #[error(transparent)]
    Engine(EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(PoolError),

    #[error(transparent)]
    Rate(#[from] RateError),
}

impl WithdrawalError {
    pub fn from_retry(reason: RetryReason) -> Self {
        match reason {
            RetryReason::BlockchainDisabled(message) => WithdrawalError::ExplorerUnavailable(message),
            other => WithdrawalError::Retryable(other),
        }
    }

    /// Normal operating conditions, not worth an error log
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            WithdrawalError::TransfersDisabled
                | WithdrawalError::WithdrawalFromProcessingDisabled
                | WithdrawalError::NothingToWithdraw
                | WithdrawalError::EmptyApprovedAddresses
        )
    }

    /// Nothing was recorded; the same unit of work stays eligible
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WithdrawalError::Retryable(_)
                | WithdrawalError::ExplorerUnavailable(_)
                | WithdrawalError::AddressUnavailable(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            WithdrawalError::TransfersDisabled => "TRANSFERS_DISABLED",
            WithdrawalError::WithdrawalFromProcessingDisabled => {
                "WITHDRAWAL_FROM_PROCESSING_DISABLED"
            }
            WithdrawalError::NothingToWithdraw => "NOTHING_TO_WITHDRAW",
            WithdrawalError::EmptyApprovedAddresses => "EMPTY_APPROVED_ADDRESSES",
            WithdrawalError::Retryable(_) => "RETRYABLE",
            WithdrawalError::ExplorerUnavailable(_) => "EXPLORER_UNAVAILABLE",
            WithdrawalError::AddressUnavailable(_) => "ADDRESS_UNAVAILABLE",
            WithdrawalError::ManualAddressNotSet => "MANUAL_ADDRESS_NOT_SET",
            WithdrawalError::ManualAddressNotApproved(_) => "MANUAL_ADDRESS_NOT_APPROVED",
            WithdrawalError::ManualAddressInUse(_) => "MANUAL_ADDRESS_IN_USE",
            WithdrawalError::UnknownRuleMode(_) => "UNKNOWN_RULE_MODE",
            WithdrawalError::NoProcessingOwner(_) => "NO_PROCESSING_OWNER",
            WithdrawalError::InvalidAddress { .. } => "INVALID_ADDRESS",
            WithdrawalError::InvalidAmount(_) => "INVALID_AMOUNT",
            WithdrawalError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            WithdrawalError::TransferFailed { .. } => "TRANSFER_FAILED",
            WithdrawalError::Engine(e) => e.code(),
            WithdrawalError::Store(e) => e.code(),
            WithdrawalError::Pool(e) => e.code(),
            WithdrawalError::Rate(e) => e.code(),
        }
    }
}

impl From<EngineError> for WithdrawalError {
    fn from(e: EngineError) -> Self {
        match RetryReason::from_error(e) {
            Ok(reason) => WithdrawalError::from_retry(reason),
            Err(other) => WithdrawalError::Engine(other),
        }
    }
}

impl From<PoolError> for WithdrawalError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Engine(e) => e.into(),
            PoolError::Store(e) => WithdrawalError::Store(e),
            PoolError::NoProcessingOwner(user_id) => WithdrawalError::NoProcessingOwner(user_id),
            PoolError::Conflict { address_id, .. } => {
                WithdrawalError::AddressUnavailable(address_id.to_string())
            }
            PoolError::IllegalTransition(t) => WithdrawalError::AddressUnavailable(t.to_string()),
            other => WithdrawalError::Pool(other),
        }
    }
}

/// Address id for [`WithdrawalError::AddressUnavailable`] messages
pub(crate) fn busy(address_id: Uuid) -> WithdrawalError {
    WithdrawalError::AddressUnavailable(address_id.to_string())
}
