//! Data models for custodial wallets, withdrawal policies and transfers

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::core_types::{Blockchain, CurrencyId, OwnerId, StoreId, TransferId, UserId};

/// Per-user setting keys read by the orchestration core
pub mod settings {
    /// `disabled` turns off every scheduled sweep for the user.
    pub const TRANSFERS: &str = "transfers";
    /// Must be `enabled` for API withdrawals from the processing wallet.
    pub const WITHDRAW_FROM_PROCESSING: &str = "withdraw_from_processing";
    /// `resources` or `burn` (default) for resource-funded chains.
    pub const TRON_TRANSFER_TYPE: &str = "tron_transfer_type";

    pub const ENABLED: &str = "enabled";
    pub const DISABLED: &str = "disabled";
    pub const TRANSFER_TYPE_RESOURCES: &str = "resources";
}

// ============================================================================
// Users & Currencies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub processing_owner_id: Option<OwnerId>,
    /// Rate source used for USD valuations (e.g. `binance`).
    pub rate_source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub id: CurrencyId,
    pub code: String,
    pub blockchain: Blockchain,
    /// Token contract; `None` for the chain's native asset.
    pub contract_address: Option<String>,
    pub is_stablecoin: bool,
    pub precision: u32,
}

impl Currency {
    #[inline]
    pub fn is_native(&self) -> bool {
        self.contract_address.is_none()
    }

    /// Contract as sent to the engine (empty string for native assets)
    pub fn contract(&self) -> &str {
        self.contract_address.as_deref().unwrap_or("")
    }
}

// ============================================================================
// Wallet Addresses
// ============================================================================

/// Wallet address status
///
/// Transitions are validated by [`AddressStatus::transition`]:
///
/// ```text
/// AVAILABLE → RESERVED → AVAILABLE
///                  ↓
///               LOCKED → AVAILABLE
/// ```
///
/// `STATIC` addresses are permanently bound and never move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Available,
    Reserved,
    Locked,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal address status transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: AddressStatus,
    pub to: AddressStatus,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::Available => "available",
            AddressStatus::Reserved => "reserved",
            AddressStatus::Locked => "locked",
            AddressStatus::Static => "static",
        }
    }

    #[inline]
    pub fn can_transition_to(&self, to: AddressStatus) -> bool {
        matches!(
            (self, to),
            (AddressStatus::Available, AddressStatus::Reserved)
                | (AddressStatus::Reserved, AddressStatus::Available)
                | (AddressStatus::Reserved, AddressStatus::Locked)
                | (AddressStatus::Locked, AddressStatus::Available)
        )
    }

    pub fn transition(self, to: AddressStatus) -> Result<AddressStatus, IllegalTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AddressStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(AddressStatus::Available),
            "reserved" => Ok(AddressStatus::Reserved),
            "locked" => Ok(AddressStatus::Locked),
            "static" => Ok(AddressStatus::Static),
            _ => Err(format!("Invalid address status: {}", s)),
        }
    }
}

/// How an address is bound to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Permanently attached to a customer wallet
    Wallet,
    /// Pooled, handed out per payment and rotated back
    Rotate,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Wallet => "wallet",
            AccountType::Rotate => "rotate",
        }
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet" => Ok(AccountType::Wallet),
            "rotate" => Ok(AccountType::Rotate),
            _ => Err(format!("Invalid account type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub id: Uuid,
    pub user_id: UserId,
    pub store_id: StoreId,
    pub account_id: Option<Uuid>,
    pub currency_id: CurrencyId,
    pub blockchain: Blockchain,
    pub address: String,
    pub status: AddressStatus,
    pub account_type: AccountType,
    /// Flagged by the processing engine as unsafe to hand out again
    pub dirty: bool,
    pub balance: Decimal,
    pub balance_usd: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit log row written on every address status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressLogEntry {
    pub id: Uuid,
    pub wallet_address_id: Uuid,
    pub old_status: AddressStatus,
    pub new_status: AddressStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Withdrawal Wallets
// ============================================================================

/// How often a withdrawal wallet is swept automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalInterval {
    #[default]
    Never,
    EveryOneHour,
    EveryOneDay,
    EveryOneWeek,
}

impl WithdrawalInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalInterval::Never => "never",
            WithdrawalInterval::EveryOneHour => "every_one_hour",
            WithdrawalInterval::EveryOneDay => "every_one_day",
            WithdrawalInterval::EveryOneWeek => "every_one_week",
        }
    }

    /// Minimum gap between two sweeps, `None` for [`WithdrawalInterval::Never`]
    pub fn period(&self) -> Option<Duration> {
        match self {
            WithdrawalInterval::Never => None,
            WithdrawalInterval::EveryOneHour => Some(Duration::hours(1)),
            WithdrawalInterval::EveryOneDay => Some(Duration::days(1)),
            WithdrawalInterval::EveryOneWeek => Some(Duration::weeks(1)),
        }
    }
}

impl FromStr for WithdrawalInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(WithdrawalInterval::Never),
            "every_one_hour" => Ok(WithdrawalInterval::EveryOneHour),
            "every_one_day" => Ok(WithdrawalInterval::EveryOneDay),
            "every_one_week" => Ok(WithdrawalInterval::EveryOneWeek),
            _ => Err(format!("Invalid withdrawal interval: {}", s)),
        }
    }
}

/// Minimum balance an address must hold before it is swept.
///
/// A zero threshold is ignored. With both thresholds at zero any positive
/// balance qualifies; otherwise the balance must reach at least one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceThreshold {
    pub min_native: Decimal,
    pub min_usd: Decimal,
}

impl BalanceThreshold {
    pub fn new(min_native: Decimal, min_usd: Decimal) -> Self {
        Self {
            min_native,
            min_usd,
        }
    }

    pub fn is_met(&self, balance: Decimal, balance_usd: Decimal) -> bool {
        if balance <= Decimal::ZERO {
            return false;
        }
        let native_set = self.min_native > Decimal::ZERO;
        let usd_set = self.min_usd > Decimal::ZERO;
        if !native_set && !usd_set {
            return true;
        }
        (native_set && balance >= self.min_native) || (usd_set && balance_usd >= self.min_usd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalWallet {
    pub id: Uuid,
    pub user_id: UserId,
    pub currency_id: CurrencyId,
    pub blockchain: Blockchain,
    pub withdrawal_enabled: bool,
    pub min_balance_native: Decimal,
    pub min_balance_usd: Decimal,
    pub interval: WithdrawalInterval,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalWallet {
    pub fn threshold(&self) -> BalanceThreshold {
        BalanceThreshold::new(self.min_balance_native, self.min_balance_usd)
    }
}

/// Approved (cold) destination of a withdrawal wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalWalletAddress {
    pub id: Uuid,
    pub withdrawal_wallet_id: Uuid,
    pub address: String,
    pub name: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Destination policy of a multi-address consolidation sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiWithdrawalMode {
    /// Always the configured `manual_address`
    Manual,
    /// The owner's processing wallet on the chain
    Processing,
    /// Uniformly random approved address
    Random,
}

impl MultiWithdrawalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultiWithdrawalMode::Manual => "manual",
            MultiWithdrawalMode::Processing => "processing",
            MultiWithdrawalMode::Random => "random",
        }
    }
}

impl FromStr for MultiWithdrawalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(MultiWithdrawalMode::Manual),
            "processing" => Ok(MultiWithdrawalMode::Processing),
            "random" => Ok(MultiWithdrawalMode::Random),
            _ => Err(format!("Unknown multi-withdrawal mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiWithdrawalRule {
    pub id: Uuid,
    pub withdrawal_wallet_id: Uuid,
    pub mode: MultiWithdrawalMode,
    pub manual_address: Option<String>,
}

// ============================================================================
// Transfers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Hot wallet sweep, engine moves the whole balance
    FromAddress,
    /// Withdrawal of a fixed amount from the owner's processing wallet
    FromProcessing,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::FromAddress => "from_address",
            TransferKind::FromProcessing => "from_processing",
        }
    }
}

impl FromStr for TransferKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "from_address" => Ok(TransferKind::FromAddress),
            "from_processing" => Ok(TransferKind::FromProcessing),
            _ => Err(format!("Invalid transfer kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    InProgress,
    Completed,
    Failed,
}

impl TransferStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStage::InProgress => "in_progress",
            TransferStage::Completed => "completed",
            TransferStage::Failed => "failed",
        }
    }
}

impl FromStr for TransferStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(TransferStage::InProgress),
            "completed" => Ok(TransferStage::Completed),
            "failed" => Ok(TransferStage::Failed),
            _ => Err(format!("Invalid transfer stage: {}", s)),
        }
    }
}

/// Transfer status
///
/// Only `New` and `Failed` are produced here; the remaining states are
/// advanced by the external reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    New,
    Processing,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::New => "new",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, TransferStatus::Failed)
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TransferStatus::New),
            "processing" => Ok(TransferStatus::Processing),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            _ => Err(format!("Invalid transfer status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
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
    pub created_at: DateTime<Utc>,
}

/// API-initiated withdrawal from the owner's processing wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalFromProcessingWallet {
    pub id: Uuid,
    pub user_id: UserId,
    pub currency_id: CurrencyId,
    /// Client idempotency key, globally unique
    pub request_id: String,
    pub to_address: String,
    pub amount: Decimal,
    pub amount_usd: Option<Decimal>,
    /// Set once, when a transfer attempt produced a record
    pub transfer_id: Option<TransferId>,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalFromProcessingWallet {
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.transfer_id.is_none()
    }
}

/// Observed on-chain movement, used for destination continuity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub blockchain: Blockchain,
    pub from_address: String,
    pub to_address: String,
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
}
