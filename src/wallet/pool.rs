//! Wallet Address Pool
//!
//! Owns every `WalletAddress.status` change. Each transition is a fresh read,
//! a validated [`AddressStatus::transition`], a storage compare-and-set and
//! a best-effort audit log append.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core_types::{Blockchain, OwnerId, StoreId, UserId};
use crate::models::{AccountType, AddressStatus, Currency, IllegalTransition, User, WalletAddress};
use crate::processing::{CreateHotWalletRequest, EngineError, ProcessingClient};
use crate::storage::{NewAddressLog, NewWalletAddress, Storage, StoreError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// The row left `expected` between read and write
    #[error("Address {address_id} is no longer {expected}")]
    Conflict {
        address_id: Uuid,
        expected: AddressStatus,
    },

    #[error("User {0} has no processing owner")]
    NoProcessingOwner(UserId),

    #[error("Processing engine minted no address for {0}")]
    CurrencyNotMinted(String),
}

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Store(e) => e.code(),
            PoolError::Engine(e) => e.code(),
            PoolError::IllegalTransition(_) => "POOL_ILLEGAL_TRANSITION",
            PoolError::Conflict { .. } => "POOL_CONFLICT",
            PoolError::NoProcessingOwner(_) => "POOL_NO_PROCESSING_OWNER",
            PoolError::CurrencyNotMinted(_) => "POOL_CURRENCY_NOT_MINTED",
        }
    }
}

pub struct WalletAddressPool {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ProcessingClient>,
    /// Address format hint per blockchain, e.g. `bitcoin: p2wpkh`
    address_hints: HashMap<Blockchain, String>,
}

impl WalletAddressPool {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ProcessingClient>,
        address_hints: HashMap<Blockchain, String>,
    ) -> Self {
        Self {
            storage,
            engine,
            address_hints,
        }
    }

    /// Free rotate address of the store, minted on demand
    pub async fn get_available(
        &self,
        user: &User,
        store_id: StoreId,
        currency: &Currency,
    ) -> Result<WalletAddress, PoolError> {
        if let Some(address) = self
            .storage
            .find_available_address(user.id, store_id, &currency.id)
            .await?
        {
            return Ok(address);
        }
        self.add_from_processing(user, store_id, currency).await
    }

    /// Mint a hot wallet on the engine and persist it.
    ///
    /// Non-EVM chains get one row per currency on the chain, so a tron
    /// address also receives USDT. Returns the row of `currency`.
    pub async fn add_from_processing(
        &self,
        user: &User,
        store_id: StoreId,
        currency: &Currency,
    ) -> Result<WalletAddress, PoolError> {
        let owner_id = user
            .processing_owner_id
            .ok_or(PoolError::NoProcessingOwner(user.id))?;
        let blockchain = currency.blockchain;

        let address_type = if blockchain.supports_address_type_hint() {
            self.address_hints.get(&blockchain).cloned()
        } else {
            None
        };

        let address = self
            .engine
            .create_owner_hot_wallet(CreateHotWalletRequest {
                owner_id,
                customer_id: store_id,
                blockchain,
                address_type,
            })
            .await?;

        let mut currencies = if blockchain.is_evm() {
            Vec::new()
        } else {
            self.storage.get_currencies_by_blockchain(blockchain).await?
        };
        if !currencies.iter().any(|c| c.id == currency.id) {
            currencies.push(currency.clone());
        }

        let rows = currencies
            .into_iter()
            .map(|c| NewWalletAddress {
                user_id: user.id,
                store_id,
                account_id: None,
                currency_id: c.id,
                blockchain,
                address: address.clone(),
                account_type: AccountType::Rotate,
            })
            .collect();
        let created = self.storage.create_wallet_addresses(rows).await?;

        info!(
            user_id = %user.id,
            blockchain = %blockchain,
            address = %address,
            rows = created.len(),
            "Hot wallet added from processing"
        );

        created
            .into_iter()
            .find(|a| a.currency_id == currency.id)
            .ok_or_else(|| PoolError::CurrencyNotMinted(currency.id.clone()))
    }

    pub async fn reserve(&self, address_id: Uuid) -> Result<WalletAddress, PoolError> {
        self.transition(address_id, AddressStatus::Reserved).await
    }

    pub async fn release(&self, address_id: Uuid) -> Result<WalletAddress, PoolError> {
        self.transition(address_id, AddressStatus::Available).await
    }

    pub async fn lock(&self, address_id: Uuid) -> Result<WalletAddress, PoolError> {
        self.transition(address_id, AddressStatus::Locked).await
    }

    /// Release every reserved or locked address bound to the account.
    ///
    /// Rows that moved concurrently are skipped. Returns how many were freed.
    pub async fn release_by_account_id(&self, account_id: Uuid) -> Result<usize, PoolError> {
        let addresses = self.storage.get_addresses_by_account_id(account_id).await?;
        let mut released = 0;
        for address in addresses {
            if !matches!(
                address.status,
                AddressStatus::Reserved | AddressStatus::Locked
            ) {
                continue;
            }
            match self.release(address.id).await {
                Ok(_) => released += 1,
                Err(PoolError::Conflict { .. }) => {
                    debug!(address_id = %address.id, "Address moved during account release");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Retire an address the engine flagged for reuse risk
    pub async fn mark_dirty(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        address: &str,
    ) -> Result<u64, PoolError> {
        self.engine
            .mark_dirty_hot_wallet(owner_id, blockchain, address)
            .await?;
        let rows = self.storage.mark_address_dirty(address).await?;
        info!(blockchain = %blockchain, address, rows, "Address marked dirty");
        Ok(rows)
    }

    async fn transition(
        &self,
        address_id: Uuid,
        to: AddressStatus,
    ) -> Result<WalletAddress, PoolError> {
        let mut current = self.storage.get_wallet_address(address_id).await?;
        let from = current.status;
        let next = from.transition(to)?;

        if !self
            .storage
            .compare_and_set_address_status(address_id, from, next)
            .await?
        {
            return Err(PoolError::Conflict {
                address_id,
                expected: from,
            });
        }

        let entry = NewAddressLog {
            wallet_address_id: address_id,
            old_status: from,
            new_status: next,
            message: format!("status changed from {} to {}", from, next),
        };
        if let Err(e) = self.storage.append_address_log(entry).await {
            warn!(address_id = %address_id, error = %e, "Failed to write address log");
        }

        current.status = next;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::MockProcessingClient;
    use crate::storage::MemoryStorage;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        engine: Arc<MockProcessingClient>,
        pool: WalletAddressPool,
        user: User,
    }

    fn currency(id: &str, blockchain: Blockchain, contract: Option<&str>) -> Currency {
        Currency {
            id: id.to_string(),
            code: id.split('.').next().unwrap_or(id).to_string(),
            blockchain,
            contract_address: contract.map(str::to_string),
            is_stablecoin: contract.is_some(),
            precision: 6,
        }
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let engine = Arc::new(MockProcessingClient::new());
        let user = User {
            id: Uuid::new_v4(),
            email: "merchant@example.com".into(),
            processing_owner_id: Some(Uuid::new_v4()),
            rate_source: "binance".into(),
        };
        storage.insert_user(user.clone());
        storage.insert_currency(currency("TRX", Blockchain::Tron, None));
        storage.insert_currency(currency("USDT.Tron", Blockchain::Tron, Some("TR7NHq")));
        storage.insert_currency(currency("ETH", Blockchain::Ethereum, None));
        storage.insert_currency(currency("USDT.Ethereum", Blockchain::Ethereum, Some("0xdac1")));
        storage.insert_currency(currency("BTC", Blockchain::Bitcoin, None));

        let hints = HashMap::from([(Blockchain::Bitcoin, "p2wpkh".to_string())]);
        let pool = WalletAddressPool::new(storage.clone(), engine.clone(), hints);
        Fixture {
            storage,
            engine,
            pool,
            user,
        }
    }

    #[tokio::test]
    async fn test_reserve_release_round_trip_logs_twice() {
        let f = fixture();
        let store_id = Uuid::new_v4();
        let trx = f.storage.get_currency("TRX").await.unwrap();
        let address = f.pool.get_available(&f.user, store_id, &trx).await.unwrap();

        let reserved = f.pool.reserve(address.id).await.unwrap();
        assert_eq!(reserved.status, AddressStatus::Reserved);
        let released = f.pool.release(address.id).await.unwrap();
        assert_eq!(released.status, AddressStatus::Available);

        let logs = f.storage.get_address_logs(address.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(
            (logs[0].old_status, logs[0].new_status),
            (AddressStatus::Available, AddressStatus::Reserved)
        );
        assert_eq!(
            (logs[1].old_status, logs[1].new_status),
            (AddressStatus::Reserved, AddressStatus::Available)
        );
    }

    #[tokio::test]
    async fn test_double_reserve_is_rejected() {
        let f = fixture();
        let btc = f.storage.get_currency("BTC").await.unwrap();
        let address = f
            .pool
            .add_from_processing(&f.user, Uuid::new_v4(), &btc)
            .await
            .unwrap();

        f.pool.reserve(address.id).await.unwrap();
        let err = f.pool.reserve(address.id).await.unwrap_err();
        assert!(matches!(err, PoolError::IllegalTransition(_)));
        assert_eq!(f.storage.get_address_logs(address.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_requires_reservation() {
        let f = fixture();
        let btc = f.storage.get_currency("BTC").await.unwrap();
        let address = f
            .pool
            .add_from_processing(&f.user, Uuid::new_v4(), &btc)
            .await
            .unwrap();

        assert!(f.pool.lock(address.id).await.is_err());
        f.pool.reserve(address.id).await.unwrap();
        assert_eq!(
            f.pool.lock(address.id).await.unwrap().status,
            AddressStatus::Locked
        );
        assert_eq!(
            f.pool.release(address.id).await.unwrap().status,
            AddressStatus::Available
        );
    }

    #[tokio::test]
    async fn test_audit_failure_keeps_transition() {
        let f = fixture();
        let btc = f.storage.get_currency("BTC").await.unwrap();
        let address = f
            .pool
            .add_from_processing(&f.user, Uuid::new_v4(), &btc)
            .await
            .unwrap();

        f.storage.set_fail_audit_log(true);
        f.pool.reserve(address.id).await.unwrap();
        let stored = f.storage.get_wallet_address(address.id).await.unwrap();
        assert_eq!(stored.status, AddressStatus::Reserved);
        assert!(f.storage.all_address_logs().is_empty());
    }

    #[tokio::test]
    async fn test_non_evm_mints_row_per_chain_currency() {
        let f = fixture();
        let usdt = f.storage.get_currency("USDT.Tron").await.unwrap();
        let address = f
            .pool
            .add_from_processing(&f.user, Uuid::new_v4(), &usdt)
            .await
            .unwrap();

        assert_eq!(address.currency_id, "USDT.Tron");
        let rows: Vec<_> = f
            .storage
            .wallet_addresses()
            .into_iter()
            .filter(|a| a.address == address.address)
            .collect();
        assert_eq!(rows.len(), 2);
        assert!(Blockchain::Tron.is_valid_address(&address.address));
    }

    #[tokio::test]
    async fn test_evm_mints_single_row() {
        let f = fixture();
        let usdt = f.storage.get_currency("USDT.Ethereum").await.unwrap();
        f.pool
            .add_from_processing(&f.user, Uuid::new_v4(), &usdt)
            .await
            .unwrap();
        assert_eq!(f.storage.wallet_addresses().len(), 1);
    }

    #[tokio::test]
    async fn test_address_hint_only_for_supported_chains() {
        let f = fixture();
        let store_id = Uuid::new_v4();
        let btc = f.storage.get_currency("BTC").await.unwrap();
        let eth = f.storage.get_currency("ETH").await.unwrap();
        f.pool.add_from_processing(&f.user, store_id, &btc).await.unwrap();
        f.pool.add_from_processing(&f.user, store_id, &eth).await.unwrap();

        let requests = f.engine.hot_wallet_requests();
        assert_eq!(requests[0].address_type.as_deref(), Some("p2wpkh"));
        assert_eq!(requests[0].customer_id, store_id);
        assert_eq!(requests[1].address_type, None);
    }

    #[tokio::test]
    async fn test_dirty_address_is_replaced() {
        let f = fixture();
        let store_id = Uuid::new_v4();
        let btc = f.storage.get_currency("BTC").await.unwrap();
        let first = f.pool.get_available(&f.user, store_id, &btc).await.unwrap();
        assert_eq!(
            f.pool.get_available(&f.user, store_id, &btc).await.unwrap().id,
            first.id
        );

        let owner = f.user.processing_owner_id.unwrap();
        let rows = f
            .pool
            .mark_dirty(owner, Blockchain::Bitcoin, &first.address)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(f.engine.dirty_addresses().len(), 1);

        let replacement = f.pool.get_available(&f.user, store_id, &btc).await.unwrap();
        assert_ne!(replacement.address, first.address);
    }

    #[tokio::test]
    async fn test_release_by_account_id() {
        let f = fixture();
        let account_id = Uuid::new_v4();
        let created = f
            .storage
            .create_wallet_addresses(vec![
                NewWalletAddress {
                    user_id: f.user.id,
                    store_id: Uuid::new_v4(),
                    account_id: Some(account_id),
                    currency_id: "TRX".into(),
                    blockchain: Blockchain::Tron,
                    address: "TAccountOne".into(),
                    account_type: AccountType::Wallet,
                },
                NewWalletAddress {
                    user_id: f.user.id,
                    store_id: Uuid::new_v4(),
                    account_id: Some(account_id),
                    currency_id: "USDT.Tron".into(),
                    blockchain: Blockchain::Tron,
                    address: "TAccountOne".into(),
                    account_type: AccountType::Wallet,
                },
            ])
            .await
            .unwrap();
        f.pool.reserve(created[0].id).await.unwrap();

        assert_eq!(f.pool.release_by_account_id(account_id).await.unwrap(), 1);
        for row in f.storage.get_addresses_by_account_id(account_id).await.unwrap() {
            assert_eq!(row.status, AddressStatus::Available);
        }
    }

    #[tokio::test]
    async fn test_user_without_owner_cannot_mint() {
        let f = fixture();
        let mut user = f.user.clone();
        user.processing_owner_id = None;
        let btc = f.storage.get_currency("BTC").await.unwrap();
        let err = f
            .pool
            .add_from_processing(&user, Uuid::new_v4(), &btc)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NoProcessingOwner(user.id));
        assert!(f.engine.hot_wallet_requests().is_empty());
    }
}
