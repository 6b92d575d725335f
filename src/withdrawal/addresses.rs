//! Approved withdrawal destinations and multi-withdrawal rules
//!
//! Destinations are registered with the processing engine as cold wallets
//! before they are stored locally.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use super::error::WithdrawalError;
use super::rule::{parse_mode, validate_rule};
use crate::models::{MultiWithdrawalMode, MultiWithdrawalRule, User, WithdrawalWalletAddress};
use crate::processing::ProcessingClient;
use crate::storage::Storage;

pub struct WithdrawalAddressBook {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ProcessingClient>,
}

impl WithdrawalAddressBook {
    pub fn new(storage: Arc<dyn Storage>, engine: Arc<dyn ProcessingClient>) -> Self {
        Self { storage, engine }
    }

    /// Approve destinations, restoring previously removed ones.
    ///
    /// Every address is validated before anything is sent to the engine.
    pub async fn add_addresses(
        &self,
        user: &User,
        currency_id: &str,
        addresses: Vec<String>,
        totp: &str,
    ) -> Result<Vec<WithdrawalWalletAddress>, WithdrawalError> {
        let owner_id = user
            .processing_owner_id
            .ok_or(WithdrawalError::NoProcessingOwner(user.id))?;
        let currency = self.storage.get_currency(currency_id).await?;

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(addresses.len());
        for address in addresses {
            let address = address.trim().to_string();
            if !currency.blockchain.is_valid_address(&address) {
                return Err(WithdrawalError::InvalidAddress {
                    blockchain: currency.blockchain,
                    address,
                });
            }
            if seen.insert(address.clone()) {
                unique.push(address);
            }
        }
        if unique.is_empty() {
            return Err(WithdrawalError::EmptyApprovedAddresses);
        }

        self.engine
            .attach_owner_cold_wallets(owner_id, currency.blockchain, &unique, totp)
            .await?;

        let wallet = self
            .storage
            .get_or_create_withdrawal_wallet(user.id, &currency.id)
            .await?;
        let saved = self
            .storage
            .upsert_withdrawal_addresses(wallet.id, &unique)
            .await?;

        info!(
            user_id = %user.id,
            wallet_id = %wallet.id,
            count = saved.len(),
            "Withdrawal addresses approved"
        );
        Ok(saved)
    }

    /// Soft-delete a destination unless the manual rule points at it
    pub async fn remove_address(
        &self,
        user: &User,
        currency_id: &str,
        address: &str,
    ) -> Result<(), WithdrawalError> {
        let wallet = self
            .storage
            .get_or_create_withdrawal_wallet(user.id, currency_id)
            .await?;

        if let Some(rule) = self.storage.get_multi_withdrawal_rule(wallet.id).await?
            && rule.mode == MultiWithdrawalMode::Manual
            && rule.manual_address.as_deref() == Some(address)
        {
            return Err(WithdrawalError::ManualAddressInUse(address.to_string()));
        }

        self.storage
            .soft_delete_withdrawal_address(wallet.id, address)
            .await?;
        info!(user_id = %user.id, wallet_id = %wallet.id, address, "Withdrawal address removed");
        Ok(())
    }

    /// Validate and save the wallet's multi-withdrawal rule
    pub async fn set_rule(
        &self,
        user: &User,
        currency_id: &str,
        mode: &str,
        manual_address: Option<String>,
    ) -> Result<MultiWithdrawalRule, WithdrawalError> {
        let mode = parse_mode(mode)?;
        let wallet = self
            .storage
            .get_or_create_withdrawal_wallet(user.id, currency_id)
            .await?;
        let approved = self.storage.get_approved_addresses(wallet.id).await?;
        validate_rule(mode, manual_address.as_deref(), &approved)?;

        // Only manual rules keep an address
        let manual_address = manual_address.filter(|_| mode == MultiWithdrawalMode::Manual);
        let rule = self
            .storage
            .upsert_multi_withdrawal_rule(wallet.id, mode, manual_address.as_deref())
            .await?;

        info!(user_id = %user.id, wallet_id = %wallet.id, mode = mode.as_str(), "Multi-withdrawal rule saved");
        Ok(rule)
    }
}
