//! Processing Engine Client
//!
//! The processing engine holds hot wallet keys, signs and broadcasts. This
//! module defines the contract the orchestration core needs from it, the
//! classification of its results, and two implementations (HTTP, mock).

pub mod error;
pub mod http;
pub mod mock;
pub mod outcome;

pub use error::{EngineError, codes};
pub use http::HttpProcessingClient;
pub use mock::MockProcessingClient;
pub use outcome::{Outcome, RetryReason};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{Blockchain, OwnerId, StoreId, TransferId};

/// Amount mode of a funds withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum WithdrawalAmount {
    /// Engine moves the full balance of the source addresses
    Whole,
    Exact(Decimal),
}

/// Fee payment mode for resource-funded chains (tron)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKindHint {
    /// Fee burned from the native balance
    Burn,
    /// Fee paid from delegated energy/bandwidth
    Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsWithdrawalRequest {
    pub owner_id: OwnerId,
    /// Idempotency key on the engine side, equal to the Transfer id
    pub request_id: TransferId,
    pub blockchain: Blockchain,
    pub from_addresses: Vec<String>,
    pub to_addresses: Vec<String>,
    pub amount: WithdrawalAmount,
    /// Empty for native assets
    pub contract_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransferKindHint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsWithdrawalReceipt {
    pub tx_hash: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateHotWalletRequest {
    pub owner_id: OwnerId,
    pub customer_id: StoreId,
    pub blockchain: Blockchain,
    /// Address format hint, e.g. `p2wpkh` (bitcoin, litecoin only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OwnerResources {
    pub energy: u64,
    pub bandwidth: u64,
}

/// Contract of the external processing engine.
///
/// `funds_withdrawal` is idempotent on `request_id`: replaying a request with
/// the same id never moves funds twice.
#[async_trait]
pub trait ProcessingClient: Send + Sync {
    async fn funds_withdrawal(
        &self,
        request: FundsWithdrawalRequest,
    ) -> Result<FundsWithdrawalReceipt, EngineError>;

    /// Address of the owner's processing wallet on the blockchain
    async fn get_owner_processing_wallet(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
    ) -> Result<String, EngineError>;

    /// Mint a new hot wallet, returns its address
    async fn create_owner_hot_wallet(
        &self,
        request: CreateHotWalletRequest,
    ) -> Result<String, EngineError>;

    async fn mark_dirty_hot_wallet(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        address: &str,
    ) -> Result<(), EngineError>;

    /// Register approved cold wallets, authorised with the owner's TOTP code
    async fn attach_owner_cold_wallets(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        addresses: &[String],
        totp: &str,
    ) -> Result<(), EngineError>;

    async fn get_owner_resources(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
    ) -> Result<OwnerResources, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_request_serialization() {
        let request = FundsWithdrawalRequest {
            owner_id: Uuid::nil(),
            request_id: Uuid::nil(),
            blockchain: Blockchain::Tron,
            from_addresses: vec!["TXa".into()],
            to_addresses: vec!["TXb".into()],
            amount: WithdrawalAmount::Whole,
            contract_address: String::new(),
            kind: Some(TransferKindHint::Resources),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["blockchain"], "tron");
        assert_eq!(json["amount"]["mode"], "whole");
        assert_eq!(json["kind"], "resources");

        let exact = serde_json::to_value(WithdrawalAmount::Exact("1.5".parse().unwrap())).unwrap();
        assert_eq!(exact["mode"], "exact");
        assert_eq!(exact["value"], "1.5");
    }

    #[test]
    fn test_kind_omitted_when_unset() {
        let request = CreateHotWalletRequest {
            owner_id: Uuid::nil(),
            customer_id: Uuid::nil(),
            blockchain: Blockchain::Ethereum,
            address_type: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("address_type").is_none());
    }
}
