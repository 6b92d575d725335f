//! Hot address sweeps.
//!
//! Single sweeps move the richest address of a withdrawal wallet to an
//! approved destination. Multi sweeps consolidate every address meeting the
//! threshold in one transfer, with the destination chosen by the wallet's
//! rule. Source addresses are reserved for the duration of the engine call.

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::CycleReport;
use super::destination::DestinationPicker;
use super::error::{WithdrawalError, busy};
use super::initiator::{TransferDto, TransferInitiator};
use super::rule::RuleResolver;
use crate::core_types::{Blockchain, UserId};
use crate::models::{
    MultiWithdrawalRule, Transfer, TransferKind, User, WalletAddress, WithdrawalWallet, settings,
};
use crate::processing::ProcessingClient;
use crate::storage::Storage;
use crate::wallet::{PoolError, WalletAddressPool};

pub struct Sweeper {
    storage: Arc<dyn Storage>,
    pool: Arc<WalletAddressPool>,
    resolver: RuleResolver,
    picker: DestinationPicker,
    initiator: Arc<TransferInitiator>,
}

impl Sweeper {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ProcessingClient>,
        pool: Arc<WalletAddressPool>,
        initiator: Arc<TransferInitiator>,
    ) -> Self {
        Self {
            resolver: RuleResolver::new(engine),
            picker: DestinationPicker::new(storage.clone()),
            storage,
            pool,
            initiator,
        }
    }

    /// Sweep the richest eligible address of the wallet
    pub async fn sweep_wallet(&self, wallet: &WithdrawalWallet) -> Result<Transfer, WithdrawalError> {
        let user = self.storage.get_user(wallet.user_id).await?;
        self.ensure_transfers_enabled(&user).await?;

        let source = self
            .storage
            .get_address_for_withdrawal(user.id, &wallet.currency_id, wallet.threshold())
            .await?
            .ok_or(WithdrawalError::NothingToWithdraw)?;

        let approved = self.storage.get_approved_addresses(wallet.id).await?;
        let to_address = self.picker.pick(&source.address, &approved).await?;

        let currency = self.storage.get_currency(&wallet.currency_id).await?;
        let reserved = self.pool.reserve(source.id).await?;

        let dto = TransferDto {
            transfer_id: None,
            kind: TransferKind::FromAddress,
            currency,
            from_addresses: vec![reserved.address.clone()],
            to_address,
            amount: reserved.balance,
            amount_usd: reserved.balance_usd,
        };
        let result = self.initiator.initiate(dto, &user, None).await;

        self.release(reserved.id).await;
        result
    }

    /// Consolidate every eligible address of the wallet in one transfer
    pub async fn multi_withdraw(
        &self,
        wallet: &WithdrawalWallet,
        rule: &MultiWithdrawalRule,
    ) -> Result<Transfer, WithdrawalError> {
        let user = self.storage.get_user(wallet.user_id).await?;
        self.ensure_transfers_enabled(&user).await?;

        let candidates = self
            .storage
            .get_addresses_for_multi_withdrawal(user.id, &wallet.currency_id, wallet.threshold())
            .await?;
        let Some(first) = candidates.first() else {
            return Err(WithdrawalError::NothingToWithdraw);
        };
        let first_id = first.id;

        let currency = self.storage.get_currency(&wallet.currency_id).await?;
        let approved = self.storage.get_approved_addresses(wallet.id).await?;
        let to_address = self
            .resolver
            .resolve_destination(&user, rule, &currency, &approved)
            .await?;

        let reserved = self.reserve_all(&candidates).await?;
        if reserved.is_empty() {
            return Err(busy(first_id));
        }

        let (amount, amount_usd) = reserved
            .iter()
            .fold((Decimal::ZERO, Decimal::ZERO), |(native, usd), a| {
                (native + a.balance, usd + a.balance_usd)
            });
        let dto = TransferDto {
            transfer_id: None,
            kind: TransferKind::FromAddress,
            currency,
            from_addresses: reserved.iter().map(|a| a.address.clone()).collect(),
            to_address,
            amount,
            amount_usd,
        };
        let result = self.initiator.initiate(dto, &user, None).await;

        for address in &reserved {
            self.release(address.id).await;
        }
        result
    }

    /// Sweep every due wallet of the blockchain, one at a time.
    ///
    /// The shutdown flag is checked between wallets only.
    pub async fn sweep_blockchain(
        &self,
        blockchain: Blockchain,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, WithdrawalError> {
        let wallets = self
            .storage
            .get_eligible_withdrawal_wallets(blockchain)
            .await?;

        let mut report = CycleReport::default();
        for wallet in &wallets {
            if *shutdown.borrow() {
                info!(blockchain = %blockchain, "Sweep interrupted by shutdown");
                break;
            }
            let result = self.sweep_wallet(wallet).await;
            log_result(wallet.id, blockchain, &result);
            report.record(&result);
        }
        Ok(report)
    }

    pub async fn run_multi_withdrawals(&self) -> Result<CycleReport, WithdrawalError> {
        let wallets = self.storage.get_multi_withdrawal_wallets().await?;

        let mut report = CycleReport::default();
        for (wallet, rule) in &wallets {
            let result = self.multi_withdraw(wallet, rule).await;
            log_result(wallet.id, wallet.blockchain, &result);
            report.record(&result);
        }
        Ok(report)
    }

    /// Immediate sweep for one wallet, errors returned as-is
    pub async fn withdraw_now(
        &self,
        user_id: UserId,
        currency_id: &str,
    ) -> Result<Transfer, WithdrawalError> {
        let wallet = self
            .storage
            .get_or_create_withdrawal_wallet(user_id, currency_id)
            .await?;
        let transfer = match self.storage.get_multi_withdrawal_rule(wallet.id).await? {
            Some(rule) => self.multi_withdraw(&wallet, &rule).await?,
            None => self.sweep_wallet(&wallet).await?,
        };

        if transfer.status.is_failed() {
            return Err(WithdrawalError::TransferFailed {
                transfer_id: transfer.id,
                message: transfer.message.unwrap_or_default(),
            });
        }
        Ok(transfer)
    }

    async fn ensure_transfers_enabled(&self, user: &User) -> Result<(), WithdrawalError> {
        let setting = self
            .storage
            .get_user_setting(user.id, settings::TRANSFERS)
            .await?;
        if setting.as_deref() == Some(settings::DISABLED) {
            return Err(WithdrawalError::TransfersDisabled);
        }
        Ok(())
    }

    /// Reserve each candidate, skipping ones another flow holds
    async fn reserve_all(
        &self,
        candidates: &[WalletAddress],
    ) -> Result<Vec<WalletAddress>, WithdrawalError> {
        let mut reserved = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.pool.reserve(candidate.id).await {
                Ok(address) => reserved.push(address),
                Err(PoolError::Conflict { .. } | PoolError::IllegalTransition(_)) => {
                    debug!(address_id = %candidate.id, "Address busy, left out of consolidation");
                }
                Err(e) => {
                    for address in &reserved {
                        self.release(address.id).await;
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(reserved)
    }

    async fn release(&self, address_id: Uuid) {
        if let Err(e) = self.pool.release(address_id).await {
            warn!(address_id = %address_id, error = %e, "Failed to release address");
        }
    }
}

fn log_result(wallet_id: Uuid, blockchain: Blockchain, result: &Result<Transfer, WithdrawalError>) {
    match result {
        Ok(transfer) if transfer.status.is_failed() => {
            warn!(
                wallet_id = %wallet_id,
                blockchain = %blockchain,
                transfer_id = %transfer.id,
                "Sweep recorded as failed"
            );
        }
        Ok(transfer) => {
            debug!(wallet_id = %wallet_id, blockchain = %blockchain, transfer_id = %transfer.id, "Sweep initiated");
        }
        Err(e) if e.is_expected() => {
            debug!(wallet_id = %wallet_id, blockchain = %blockchain, reason = %e, "Sweep skipped");
        }
        Err(e) if e.is_retryable() => {
            info!(wallet_id = %wallet_id, blockchain = %blockchain, reason = %e, "Sweep deferred");
        }
        Err(e) => {
            error!(
                wallet_id = %wallet_id,
                blockchain = %blockchain,
                error = %e,
                code = e.code(),
                "Sweep failed"
            );
        }
    }
}
