//! Storage contract of the orchestration core.
//!
//! [`Storage`] covers single-statement operations; grouped writes go through
//! a [`StorageTx`] obtained from [`Storage::begin`] and must be committed
//! explicitly. Dropping a transaction without committing discards its writes.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::core_types::{Blockchain, CurrencyId, OwnerId, StoreId, TransferId, UserId};
use crate::models::{
    AccountType, AddressLogEntry, AddressStatus, BalanceThreshold, Currency,
    MultiWithdrawalMode, MultiWithdrawalRule, Transfer, TransferKind, TransferStage,
    TransferStatus, User, WalletAddress, WithdrawalFromProcessingWallet, WithdrawalWallet,
    WithdrawalWalletAddress,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Optimistic check failed, the row changed underneath
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Stored value does not parse into the model
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "STORE_NOT_FOUND",
            StoreError::Duplicate(_) => "STORE_DUPLICATE",
            StoreError::Conflict(_) => "STORE_CONFLICT",
            StoreError::Database(_) => "STORE_DATABASE",
            StoreError::Corrupt(_) => "STORE_CORRUPT",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub id: TransferId,
    pub user_id: UserId,
    pub kind: TransferKind,
    pub stage: TransferStage,
    pub status: TransferStatus,
    pub currency_id: CurrencyId,
    pub blockchain: Blockchain,
    pub from_addresses: Vec<String>,
    pub to_address: String,
    pub amount: Decimal,
    pub amount_usd: Decimal,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWalletAddress {
    pub user_id: UserId,
    pub store_id: StoreId,
    pub account_id: Option<Uuid>,
    pub currency_id: CurrencyId,
    pub blockchain: Blockchain,
    pub address: String,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAddressLog {
    pub wallet_address_id: Uuid,
    pub old_status: AddressStatus,
    pub new_status: AddressStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProcessingWithdrawal {
    pub user_id: UserId,
    pub currency_id: CurrencyId,
    pub request_id: String,
    pub to_address: String,
    pub amount: Decimal,
}

/// Queued processing withdrawal joined with its owner and currency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWithdrawal {
    pub request: WithdrawalFromProcessingWallet,
    pub user: User,
    pub currency: Currency,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError>;

    // --- users & currencies ---

    async fn get_user(&self, user_id: UserId) -> Result<User, StoreError>;

    /// Distinct processing owners of all users, ascending
    async fn get_processing_owner_ids(&self) -> Result<Vec<OwnerId>, StoreError>;

    /// `None` when the user never set the key
    async fn get_user_setting(
        &self,
        user_id: UserId,
        key: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn get_currency(&self, currency_id: &str) -> Result<Currency, StoreError>;

    async fn get_currencies_by_blockchain(
        &self,
        blockchain: Blockchain,
    ) -> Result<Vec<Currency>, StoreError>;

    // --- withdrawal wallets ---

    /// Enabled wallets on the blockchain, without a multi-withdrawal rule,
    /// whose interval elapsed since their last address sweep
    async fn get_eligible_withdrawal_wallets(
        &self,
        blockchain: Blockchain,
    ) -> Result<Vec<WithdrawalWallet>, StoreError>;

    /// Enabled wallets with a rule, same interval gating as above
    async fn get_multi_withdrawal_wallets(
        &self,
    ) -> Result<Vec<(WithdrawalWallet, MultiWithdrawalRule)>, StoreError>;

    async fn get_or_create_withdrawal_wallet(
        &self,
        user_id: UserId,
        currency_id: &str,
    ) -> Result<WithdrawalWallet, StoreError>;

    async fn get_multi_withdrawal_rule(
        &self,
        withdrawal_wallet_id: Uuid,
    ) -> Result<Option<MultiWithdrawalRule>, StoreError>;

    async fn upsert_multi_withdrawal_rule(
        &self,
        withdrawal_wallet_id: Uuid,
        mode: MultiWithdrawalMode,
        manual_address: Option<&str>,
    ) -> Result<MultiWithdrawalRule, StoreError>;

    /// Approved destinations that are not soft-deleted
    async fn get_approved_addresses(
        &self,
        withdrawal_wallet_id: Uuid,
    ) -> Result<Vec<String>, StoreError>;

    /// Insert new destinations and restore soft-deleted ones
    async fn upsert_withdrawal_addresses(
        &self,
        withdrawal_wallet_id: Uuid,
        addresses: &[String],
    ) -> Result<Vec<WithdrawalWalletAddress>, StoreError>;

    async fn soft_delete_withdrawal_address(
        &self,
        withdrawal_wallet_id: Uuid,
        address: &str,
    ) -> Result<(), StoreError>;

    // --- wallet addresses ---

    /// Richest available address of the user meeting the threshold
    async fn get_address_for_withdrawal(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> Result<Option<WalletAddress>, StoreError>;

    /// Every available address of the user meeting the threshold
    async fn get_addresses_for_multi_withdrawal(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> Result<Vec<WalletAddress>, StoreError>;

    /// Clean, available rotate address of the store
    async fn find_available_address(
        &self,
        user_id: UserId,
        store_id: StoreId,
        currency_id: &str,
    ) -> Result<Option<WalletAddress>, StoreError>;

    async fn get_wallet_address(&self, id: Uuid) -> Result<WalletAddress, StoreError>;

    async fn get_addresses_by_account_id(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<WalletAddress>, StoreError>;

    async fn create_wallet_addresses(
        &self,
        rows: Vec<NewWalletAddress>,
    ) -> Result<Vec<WalletAddress>, StoreError>;

    /// Set `new` only if the row is still `expected`; false on a miss
    async fn compare_and_set_address_status(
        &self,
        id: Uuid,
        expected: AddressStatus,
        new: AddressStatus,
    ) -> Result<bool, StoreError>;

    /// Flag every row holding the address, returns the number of rows
    async fn mark_address_dirty(&self, address: &str) -> Result<u64, StoreError>;

    async fn append_address_log(&self, entry: NewAddressLog) -> Result<(), StoreError>;

    async fn get_address_logs(
        &self,
        wallet_address_id: Uuid,
    ) -> Result<Vec<AddressLogEntry>, StoreError>;

    // --- transfers & history ---

    async fn create_transfer(&self, transfer: NewTransfer) -> Result<Transfer, StoreError>;

    /// Most recent approved destination `from_address` sent funds to
    async fn find_previous_destination(
        &self,
        from_address: &str,
        approved: &[String],
    ) -> Result<Option<String>, StoreError>;

    // --- processing withdrawals ---

    async fn processing_withdrawal_exists(&self, request_id: &str) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Duplicate`] on a reused `request_id`
    async fn create_processing_withdrawal(
        &self,
        request: NewProcessingWithdrawal,
    ) -> Result<WithdrawalFromProcessingWallet, StoreError>;
}

#[async_trait]
pub trait StorageTx: Send {
    /// Unlinked requests with owner and currency, locked for this transaction
    async fn get_queued_processing_withdrawals(
        &mut self,
    ) -> Result<Vec<QueuedWithdrawal>, StoreError>;

    async fn create_transfer(&mut self, transfer: NewTransfer) -> Result<Transfer, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the request is already linked
    async fn link_transfer_to_processing_withdrawal(
        &mut self,
        id: Uuid,
        transfer_id: TransferId,
        amount_usd: Option<Decimal>,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "STORE_NOT_FOUND");
    }

    #[test]
    fn test_other_sqlx_errors_map_to_database() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
