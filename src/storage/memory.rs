//! In-process storage.
//!
//! Backs the scenario tests and local dry runs. Transactions buffer their
//! writes and apply them atomically on commit; reads see committed state.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    NewAddressLog, NewProcessingWithdrawal, NewTransfer, NewWalletAddress, QueuedWithdrawal,
    Storage, StorageTx, StoreError,
};
use crate::core_types::{Blockchain, OwnerId, StoreId, TransferId, UserId};
use crate::models::{
    AccountType, AddressLogEntry, AddressStatus, BalanceThreshold, Currency,
    MultiWithdrawalMode, MultiWithdrawalRule, TransactionRecord, Transfer, TransferKind, User,
    WalletAddress, WithdrawalFromProcessingWallet, WithdrawalInterval, WithdrawalWallet,
    WithdrawalWalletAddress,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    settings: HashMap<(UserId, String), String>,
    currencies: BTreeMap<String, Currency>,
    wallet_addresses: Vec<WalletAddress>,
    address_logs: Vec<AddressLogEntry>,
    withdrawal_wallets: Vec<WithdrawalWallet>,
    withdrawal_addresses: Vec<WithdrawalWalletAddress>,
    rules: HashMap<Uuid, MultiWithdrawalRule>,
    transfers: Vec<Transfer>,
    processing_withdrawals: Vec<WithdrawalFromProcessingWallet>,
    transactions: Vec<TransactionRecord>,
    fail_audit_log: bool,
}

impl MemoryState {
    fn has_rule(&self, wallet_id: Uuid) -> bool {
        self.rules.contains_key(&wallet_id)
    }

    /// Enabled, not `never`, and the interval elapsed since the last sweep
    fn is_due(&self, wallet: &WithdrawalWallet) -> bool {
        if !wallet.withdrawal_enabled {
            return false;
        }
        let Some(period) = wallet.interval.period() else {
            return false;
        };
        let now = Utc::now();
        self.transfers
            .iter()
            .filter(|t| {
                t.kind == TransferKind::FromAddress
                    && t.user_id == wallet.user_id
                    && t.currency_id == wallet.currency_id
            })
            .map(|t| t.created_at)
            .max()
            .is_none_or(|last| now - last >= period)
    }

    fn withdrawable(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> impl Iterator<Item = &WalletAddress> {
        let currency_id = currency_id.to_string();
        self.wallet_addresses.iter().filter(move |a| {
            a.user_id == user_id
                && a.currency_id == currency_id
                && a.status == AddressStatus::Available
                && threshold.is_met(a.balance, a.balance_usd)
        })
    }

    fn queued_joined(&self, id: Uuid) -> Result<QueuedWithdrawal, StoreError> {
        let request = self
            .processing_withdrawals
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("processing withdrawal {}", id)))?;
        let user = self
            .users
            .get(&request.user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", request.user_id)))?;
        let currency = self
            .currencies
            .get(&request.currency_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("currency {}", request.currency_id)))?;
        Ok(QueuedWithdrawal {
            request,
            user,
            currency,
        })
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn build_transfer(t: NewTransfer) -> Transfer {
    Transfer {
        id: t.id,
        user_id: t.user_id,
        kind: t.kind,
        stage: t.stage,
        status: t.status,
        currency_id: t.currency_id,
        blockchain: t.blockchain,
        from_addresses: t.from_addresses,
        to_address: t.to_address,
        amount: t.amount,
        amount_usd: t.amount_usd,
        message: t.message,
        created_at: Utc::now(),
    }
}

fn insert_transfer(state: &mut MemoryState, transfer: Transfer) -> Result<(), StoreError> {
    if state.transfers.iter().any(|t| t.id == transfer.id) {
        return Err(StoreError::Duplicate(format!("transfer {}", transfer.id)));
    }
    state.transfers.push(transfer);
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn insert_user(&self, user: User) {
        lock(&self.state).users.insert(user.id, user);
    }

    pub fn set_user_setting(&self, user_id: UserId, key: &str, value: &str) {
        lock(&self.state)
            .settings
            .insert((user_id, key.to_string()), value.to_string());
    }

    pub fn insert_currency(&self, currency: Currency) {
        lock(&self.state)
            .currencies
            .insert(currency.id.clone(), currency);
    }

    pub fn insert_wallet_address(&self, address: WalletAddress) {
        lock(&self.state).wallet_addresses.push(address);
    }

    pub fn set_address_balance(&self, id: Uuid, balance: Decimal, balance_usd: Decimal) {
        let mut state = lock(&self.state);
        if let Some(row) = state.wallet_addresses.iter_mut().find(|a| a.id == id) {
            row.balance = balance;
            row.balance_usd = balance_usd;
        }
    }

    /// Insert or replace a withdrawal wallet by id
    pub fn put_withdrawal_wallet(&self, wallet: WithdrawalWallet) {
        let mut state = lock(&self.state);
        match state
            .withdrawal_wallets
            .iter_mut()
            .find(|w| w.id == wallet.id)
        {
            Some(existing) => *existing = wallet,
            None => state.withdrawal_wallets.push(wallet),
        }
    }

    pub fn insert_transaction(&self, record: TransactionRecord) {
        lock(&self.state).transactions.push(record);
    }

    /// Make audit log appends fail
    pub fn set_fail_audit_log(&self, fail: bool) {
        lock(&self.state).fail_audit_log = fail;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.state).transfers.clone()
    }

    pub fn transfer_count(&self) -> usize {
        lock(&self.state).transfers.len()
    }

    pub fn wallet_addresses(&self) -> Vec<WalletAddress> {
        lock(&self.state).wallet_addresses.clone()
    }

    pub fn all_address_logs(&self) -> Vec<AddressLogEntry> {
        lock(&self.state).address_logs.clone()
    }

    pub fn processing_withdrawals(&self) -> Vec<WithdrawalFromProcessingWallet> {
        lock(&self.state).processing_withdrawals.clone()
    }

    /// Including soft-deleted rows
    pub fn withdrawal_addresses(&self, withdrawal_wallet_id: Uuid) -> Vec<WithdrawalWalletAddress> {
        lock(&self.state)
            .withdrawal_addresses
            .iter()
            .filter(|a| a.withdrawal_wallet_id == withdrawal_wallet_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            transfers: Vec::new(),
            links: Vec::new(),
        }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        lock(&self.state)
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }

    async fn get_processing_owner_ids(&self) -> Result<Vec<OwnerId>, StoreError> {
        let mut owners: Vec<OwnerId> = lock(&self.state)
            .users
            .values()
            .filter_map(|u| u.processing_owner_id)
            .collect();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    async fn get_user_setting(
        &self,
        user_id: UserId,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.state)
            .settings
            .get(&(user_id, key.to_string()))
            .cloned())
    }

    async fn get_currency(&self, currency_id: &str) -> Result<Currency, StoreError> {
        lock(&self.state)
            .currencies
            .get(currency_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("currency {}", currency_id)))
    }

    async fn get_currencies_by_blockchain(
        &self,
        blockchain: Blockchain,
    ) -> Result<Vec<Currency>, StoreError> {
        Ok(lock(&self.state)
            .currencies
            .values()
            .filter(|c| c.blockchain == blockchain)
            .cloned()
            .collect())
    }

    async fn get_eligible_withdrawal_wallets(
        &self,
        blockchain: Blockchain,
    ) -> Result<Vec<WithdrawalWallet>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .withdrawal_wallets
            .iter()
            .filter(|w| w.blockchain == blockchain && !state.has_rule(w.id) && state.is_due(w))
            .cloned()
            .collect())
    }

    async fn get_multi_withdrawal_wallets(
        &self,
    ) -> Result<Vec<(WithdrawalWallet, MultiWithdrawalRule)>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .withdrawal_wallets
            .iter()
            .filter(|w| state.is_due(w))
            .filter_map(|w| state.rules.get(&w.id).map(|r| (w.clone(), r.clone())))
            .collect())
    }

    async fn get_or_create_withdrawal_wallet(
        &self,
        user_id: UserId,
        currency_id: &str,
    ) -> Result<WithdrawalWallet, StoreError> {
        let mut state = lock(&self.state);
        if let Some(wallet) = state
            .withdrawal_wallets
            .iter()
            .find(|w| w.user_id == user_id && w.currency_id == currency_id)
        {
            return Ok(wallet.clone());
        }
        let blockchain = state
            .currencies
            .get(currency_id)
            .map(|c| c.blockchain)
            .ok_or_else(|| StoreError::NotFound(format!("currency {}", currency_id)))?;

        let wallet = WithdrawalWallet {
            id: Uuid::new_v4(),
            user_id,
            currency_id: currency_id.to_string(),
            blockchain,
            withdrawal_enabled: false,
            min_balance_native: Decimal::ZERO,
            min_balance_usd: Decimal::ZERO,
            interval: WithdrawalInterval::Never,
            created_at: Utc::now(),
        };
        state.withdrawal_wallets.push(wallet.clone());
        Ok(wallet)
    }

    async fn get_multi_withdrawal_rule(
        &self,
        withdrawal_wallet_id: Uuid,
    ) -> Result<Option<MultiWithdrawalRule>, StoreError> {
        Ok(lock(&self.state).rules.get(&withdrawal_wallet_id).cloned())
    }

    async fn upsert_multi_withdrawal_rule(
        &self,
        withdrawal_wallet_id: Uuid,
        mode: MultiWithdrawalMode,
        manual_address: Option<&str>,
    ) -> Result<MultiWithdrawalRule, StoreError> {
        let mut state = lock(&self.state);
        let rule = state
            .rules
            .entry(withdrawal_wallet_id)
            .or_insert_with(|| MultiWithdrawalRule {
                id: Uuid::new_v4(),
                withdrawal_wallet_id,
                mode,
                manual_address: None,
            });
        rule.mode = mode;
        rule.manual_address = manual_address.map(str::to_string);
        Ok(rule.clone())
    }

    async fn get_approved_addresses(
        &self,
        withdrawal_wallet_id: Uuid,
    ) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.state)
            .withdrawal_addresses
            .iter()
            .filter(|a| a.withdrawal_wallet_id == withdrawal_wallet_id && a.deleted_at.is_none())
            .map(|a| a.address.clone())
            .collect())
    }

    async fn upsert_withdrawal_addresses(
        &self,
        withdrawal_wallet_id: Uuid,
        addresses: &[String],
    ) -> Result<Vec<WithdrawalWalletAddress>, StoreError> {
        let mut state = lock(&self.state);
        let mut saved = Vec::with_capacity(addresses.len());
        for address in addresses {
            let existing = state
                .withdrawal_addresses
                .iter_mut()
                .find(|a| a.withdrawal_wallet_id == withdrawal_wallet_id && &a.address == address);
            let row = match existing {
                Some(row) => {
                    row.deleted_at = None;
                    row.clone()
                }
                None => {
                    let row = WithdrawalWalletAddress {
                        id: Uuid::new_v4(),
                        withdrawal_wallet_id,
                        address: address.clone(),
                        name: None,
                        deleted_at: None,
                    };
                    state.withdrawal_addresses.push(row.clone());
                    row
                }
            };
            saved.push(row);
        }
        Ok(saved)
    }

    async fn soft_delete_withdrawal_address(
        &self,
        withdrawal_wallet_id: Uuid,
        address: &str,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let row = state
            .withdrawal_addresses
            .iter_mut()
            .find(|a| {
                a.withdrawal_wallet_id == withdrawal_wallet_id
                    && a.address == address
                    && a.deleted_at.is_none()
            })
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal address {}", address)))?;
        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn get_address_for_withdrawal(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> Result<Option<WalletAddress>, StoreError> {
        Ok(lock(&self.state)
            .withdrawable(user_id, currency_id, threshold)
            .max_by_key(|a| a.balance)
            .cloned())
    }

    async fn get_addresses_for_multi_withdrawal(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> Result<Vec<WalletAddress>, StoreError> {
        Ok(lock(&self.state)
            .withdrawable(user_id, currency_id, threshold)
            .cloned()
            .collect())
    }

    async fn find_available_address(
        &self,
        user_id: UserId,
        store_id: StoreId,
        currency_id: &str,
    ) -> Result<Option<WalletAddress>, StoreError> {
        Ok(lock(&self.state)
            .wallet_addresses
            .iter()
            .find(|a| {
                a.user_id == user_id
                    && a.store_id == store_id
                    && a.currency_id == currency_id
                    && a.status == AddressStatus::Available
                    && a.account_type == AccountType::Rotate
                    && !a.dirty
            })
            .cloned())
    }

    async fn get_wallet_address(&self, id: Uuid) -> Result<WalletAddress, StoreError> {
        lock(&self.state)
            .wallet_addresses
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("wallet address {}", id)))
    }

    async fn get_addresses_by_account_id(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<WalletAddress>, StoreError> {
        Ok(lock(&self.state)
            .wallet_addresses
            .iter()
            .filter(|a| a.account_id == Some(account_id))
            .cloned()
            .collect())
    }

    async fn create_wallet_addresses(
        &self,
        rows: Vec<NewWalletAddress>,
    ) -> Result<Vec<WalletAddress>, StoreError> {
        let mut state = lock(&self.state);
        for row in &rows {
            if state
                .wallet_addresses
                .iter()
                .any(|a| a.address == row.address && a.currency_id == row.currency_id)
            {
                return Err(StoreError::Duplicate(format!(
                    "wallet address {} ({})",
                    row.address, row.currency_id
                )));
            }
        }

        let now = Utc::now();
        let created: Vec<WalletAddress> = rows
            .into_iter()
            .map(|row| WalletAddress {
                id: Uuid::new_v4(),
                user_id: row.user_id,
                store_id: row.store_id,
                account_id: row.account_id,
                currency_id: row.currency_id,
                blockchain: row.blockchain,
                address: row.address,
                status: AddressStatus::Available,
                account_type: row.account_type,
                dirty: false,
                balance: Decimal::ZERO,
                balance_usd: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            })
            .collect();
        state.wallet_addresses.extend(created.iter().cloned());
        Ok(created)
    }

    async fn compare_and_set_address_status(
        &self,
        id: Uuid,
        expected: AddressStatus,
        new: AddressStatus,
    ) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        let row = state
            .wallet_addresses
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("wallet address {}", id)))?;
        if row.status != expected {
            return Ok(false);
        }
        row.status = new;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_address_dirty(&self, address: &str) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        let mut marked = 0;
        for row in state
            .wallet_addresses
            .iter_mut()
            .filter(|a| a.address == address)
        {
            row.dirty = true;
            row.updated_at = Utc::now();
            marked += 1;
        }
        Ok(marked)
    }

    async fn append_address_log(&self, entry: NewAddressLog) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.fail_audit_log {
            return Err(StoreError::Database("audit log unavailable".to_string()));
        }
        state.address_logs.push(AddressLogEntry {
            id: Uuid::new_v4(),
            wallet_address_id: entry.wallet_address_id,
            old_status: entry.old_status,
            new_status: entry.new_status,
            message: entry.message,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_address_logs(
        &self,
        wallet_address_id: Uuid,
    ) -> Result<Vec<AddressLogEntry>, StoreError> {
        Ok(lock(&self.state)
            .address_logs
            .iter()
            .filter(|l| l.wallet_address_id == wallet_address_id)
            .cloned()
            .collect())
    }

    async fn create_transfer(&self, transfer: NewTransfer) -> Result<Transfer, StoreError> {
        let transfer = build_transfer(transfer);
        insert_transfer(&mut lock(&self.state), transfer.clone())?;
        Ok(transfer)
    }

    async fn find_previous_destination(
        &self,
        from_address: &str,
        approved: &[String],
    ) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.state)
            .transactions
            .iter()
            .filter(|t| t.from_address == from_address && approved.contains(&t.to_address))
            .max_by_key(|t| t.created_at)
            .map(|t| t.to_address.clone()))
    }

    async fn processing_withdrawal_exists(&self, request_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.state)
            .processing_withdrawals
            .iter()
            .any(|r| r.request_id == request_id))
    }

    async fn create_processing_withdrawal(
        &self,
        request: NewProcessingWithdrawal,
    ) -> Result<WithdrawalFromProcessingWallet, StoreError> {
        let mut state = lock(&self.state);
        if state
            .processing_withdrawals
            .iter()
            .any(|r| r.request_id == request.request_id)
        {
            return Err(StoreError::Duplicate(format!(
                "request_id {}",
                request.request_id
            )));
        }
        let row = WithdrawalFromProcessingWallet {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            currency_id: request.currency_id,
            request_id: request.request_id,
            to_address: request.to_address,
            amount: request.amount,
            amount_usd: None,
            transfer_id: None,
            created_at: Utc::now(),
        };
        state.processing_withdrawals.push(row.clone());
        Ok(row)
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    transfers: Vec<Transfer>,
    links: Vec<(Uuid, TransferId, Option<Decimal>)>,
}

impl MemoryTx {
    fn is_linked(&self, state: &MemoryState, id: Uuid) -> Result<bool, StoreError> {
        let row = state
            .processing_withdrawals
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("processing withdrawal {}", id)))?;
        Ok(row.transfer_id.is_some() || self.links.iter().any(|(linked, _, _)| *linked == id))
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn get_queued_processing_withdrawals(
        &mut self,
    ) -> Result<Vec<QueuedWithdrawal>, StoreError> {
        let state = lock(&self.state);
        let mut queued: Vec<_> = state
            .processing_withdrawals
            .iter()
            .filter(|r| r.is_queued())
            .filter(|r| !self.links.iter().any(|(id, _, _)| *id == r.id))
            .map(|r| (r.created_at, r.id))
            .collect();
        queued.sort();
        queued
            .into_iter()
            .map(|(_, id)| state.queued_joined(id))
            .collect()
    }

    async fn create_transfer(&mut self, transfer: NewTransfer) -> Result<Transfer, StoreError> {
        let transfer = build_transfer(transfer);
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn link_transfer_to_processing_withdrawal(
        &mut self,
        id: Uuid,
        transfer_id: TransferId,
        amount_usd: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let linked = {
            let state = lock(&self.state);
            self.is_linked(&state, id)?
        };
        if linked {
            return Err(StoreError::Conflict(format!(
                "processing withdrawal {} already linked",
                id
            )));
        }
        self.links.push((id, transfer_id, amount_usd));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = lock(&this.state);

        for (id, _, _) in &this.links {
            let row = state.processing_withdrawals.iter().find(|r| r.id == *id);
            if row.is_none_or(|r| r.transfer_id.is_some()) {
                return Err(StoreError::Conflict(format!(
                    "processing withdrawal {} changed before commit",
                    id
                )));
            }
        }

        for transfer in this.transfers {
            insert_transfer(&mut state, transfer)?;
        }
        for (id, transfer_id, amount_usd) in this.links {
            if let Some(row) = state.processing_withdrawals.iter_mut().find(|r| r.id == id) {
                row.transfer_id = Some(transfer_id);
                row.amount_usd = amount_usd;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
