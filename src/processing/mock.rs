//! Scriptable in-process processing engine.
//!
//! Used by the scenario tests and for local dry runs without an engine.
//! Every call is recorded; funds withdrawals can be scripted one response at
//! a time, slowed down, and tracked for per-blockchain concurrency.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    CreateHotWalletRequest, EngineError, FundsWithdrawalReceipt, FundsWithdrawalRequest,
    OwnerResources, ProcessingClient,
};
use crate::core_types::{Blockchain, OwnerId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic, checksum-valid address for the n-th minted wallet
pub fn fake_address(blockchain: Blockchain, n: u64) -> String {
    let mut hash = [0x5a_u8; 20];
    hash[12..].copy_from_slice(&n.to_be_bytes());
    if blockchain.is_evm() {
        return format!("0x{}", hex::encode(hash));
    }
    let version = match blockchain {
        Blockchain::Litecoin => 0x30,
        Blockchain::Dogecoin => 0x1e,
        Blockchain::Tron => 0x41,
        _ => 0x00,
    };
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(&hash);
    bs58::encode(payload).with_check().into_string()
}

pub struct MockProcessingClient {
    withdrawal_script: Mutex<VecDeque<Result<FundsWithdrawalReceipt, EngineError>>>,
    latency: Mutex<Duration>,
    withdrawal_requests: Mutex<Vec<FundsWithdrawalRequest>>,
    in_flight: Mutex<HashMap<Blockchain, usize>>,
    peak_in_flight: Mutex<HashMap<Blockchain, usize>>,

    processing_wallets: Mutex<HashMap<Blockchain, String>>,
    processing_wallet_error: Mutex<Option<EngineError>>,
    processing_wallet_calls: AtomicUsize,

    minted: AtomicU64,
    hot_wallet_requests: Mutex<Vec<CreateHotWalletRequest>>,
    dirty_addresses: Mutex<Vec<(OwnerId, Blockchain, String)>>,
    cold_wallets: Mutex<Vec<(OwnerId, Blockchain, Vec<String>)>>,
    attach_error: Mutex<Option<EngineError>>,

    resources: Mutex<HashMap<OwnerId, Result<OwnerResources, EngineError>>>,
}

impl Default for MockProcessingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessingClient {
    pub fn new() -> Self {
        Self {
            withdrawal_script: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            withdrawal_requests: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            peak_in_flight: Mutex::new(HashMap::new()),
            processing_wallets: Mutex::new(HashMap::new()),
            processing_wallet_error: Mutex::new(None),
            processing_wallet_calls: AtomicUsize::new(0),
            minted: AtomicU64::new(0),
            hot_wallet_requests: Mutex::new(Vec::new()),
            dirty_addresses: Mutex::new(Vec::new()),
            cold_wallets: Mutex::new(Vec::new()),
            attach_error: Mutex::new(None),
            resources: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Queue the result of the next funds withdrawal.
    ///
    /// Once the script is empty every call succeeds with a generated hash.
    pub fn push_withdrawal_result(&self, result: Result<FundsWithdrawalReceipt, EngineError>) {
        lock(&self.withdrawal_script).push_back(result);
    }

    pub fn fail_next_withdrawal(&self, error: EngineError) {
        self.push_withdrawal_result(Err(error));
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn set_processing_wallet(&self, blockchain: Blockchain, address: &str) {
        lock(&self.processing_wallets).insert(blockchain, address.to_string());
    }

    pub fn set_processing_wallet_error(&self, error: Option<EngineError>) {
        *lock(&self.processing_wallet_error) = error;
    }

    pub fn set_attach_error(&self, error: Option<EngineError>) {
        *lock(&self.attach_error) = error;
    }

    pub fn set_owner_resources(&self, owner_id: OwnerId, result: Result<OwnerResources, EngineError>) {
        lock(&self.resources).insert(owner_id, result);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn withdrawal_requests(&self) -> Vec<FundsWithdrawalRequest> {
        lock(&self.withdrawal_requests).clone()
    }

    pub fn withdrawal_count(&self) -> usize {
        lock(&self.withdrawal_requests).len()
    }

    /// Highest number of concurrent withdrawals seen for the blockchain
    pub fn peak_in_flight(&self, blockchain: Blockchain) -> usize {
        lock(&self.peak_in_flight)
            .get(&blockchain)
            .copied()
            .unwrap_or(0)
    }

    pub fn processing_wallet_calls(&self) -> usize {
        self.processing_wallet_calls.load(Ordering::SeqCst)
    }

    pub fn hot_wallet_requests(&self) -> Vec<CreateHotWalletRequest> {
        lock(&self.hot_wallet_requests).clone()
    }

    pub fn dirty_addresses(&self) -> Vec<(OwnerId, Blockchain, String)> {
        lock(&self.dirty_addresses).clone()
    }

    pub fn cold_wallets(&self) -> Vec<(OwnerId, Blockchain, Vec<String>)> {
        lock(&self.cold_wallets).clone()
    }

    fn enter(&self, blockchain: Blockchain) {
        let mut in_flight = lock(&self.in_flight);
        let now = in_flight.entry(blockchain).or_insert(0);
        *now += 1;
        let mut peak = lock(&self.peak_in_flight);
        let max = peak.entry(blockchain).or_insert(0);
        *max = (*max).max(*now);
    }

    fn leave(&self, blockchain: Blockchain) {
        if let Some(now) = lock(&self.in_flight).get_mut(&blockchain) {
            *now = now.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ProcessingClient for MockProcessingClient {
    async fn funds_withdrawal(
        &self,
        request: FundsWithdrawalRequest,
    ) -> Result<FundsWithdrawalReceipt, EngineError> {
        let blockchain = request.blockchain;
        let request_id = request.request_id;
        lock(&self.withdrawal_requests).push(request);

        self.enter(blockchain);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.leave(blockchain);

        lock(&self.withdrawal_script)
            .pop_front()
            .unwrap_or_else(|| {
                Ok(FundsWithdrawalReceipt {
                    tx_hash: Some(format!("0x{}", request_id.simple())),
                    message: None,
                })
            })
    }

    async fn get_owner_processing_wallet(
        &self,
        _owner_id: OwnerId,
        blockchain: Blockchain,
    ) -> Result<String, EngineError> {
        self.processing_wallet_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.processing_wallet_error).clone() {
            return Err(err);
        }
        Ok(lock(&self.processing_wallets)
            .entry(blockchain)
            .or_insert_with(|| fake_address(blockchain, u64::MAX / 2))
            .clone())
    }

    async fn create_owner_hot_wallet(
        &self,
        request: CreateHotWalletRequest,
    ) -> Result<String, EngineError> {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        let address = fake_address(request.blockchain, n);
        lock(&self.hot_wallet_requests).push(request);
        Ok(address)
    }

    async fn mark_dirty_hot_wallet(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        address: &str,
    ) -> Result<(), EngineError> {
        lock(&self.dirty_addresses).push((owner_id, blockchain, address.to_string()));
        Ok(())
    }

    async fn attach_owner_cold_wallets(
        &self,
        owner_id: OwnerId,
        blockchain: Blockchain,
        addresses: &[String],
        _totp: &str,
    ) -> Result<(), EngineError> {
        if let Some(err) = lock(&self.attach_error).clone() {
            return Err(err);
        }
        lock(&self.cold_wallets).push((owner_id, blockchain, addresses.to_vec()));
        Ok(())
    }

    async fn get_owner_resources(
        &self,
        owner_id: OwnerId,
        _blockchain: Blockchain,
    ) -> Result<OwnerResources, EngineError> {
        lock(&self.resources)
            .get(&owner_id)
            .cloned()
            .unwrap_or(Ok(OwnerResources::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::WithdrawalAmount;
    use uuid::Uuid;

    fn request(blockchain: Blockchain) -> FundsWithdrawalRequest {
        FundsWithdrawalRequest {
            owner_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            blockchain,
            from_addresses: vec![fake_address(blockchain, 1)],
            to_addresses: vec![fake_address(blockchain, 2)],
            amount: WithdrawalAmount::Whole,
            contract_address: String::new(),
            kind: None,
        }
    }

    #[test]
    fn test_fake_addresses_are_valid() {
        for blockchain in Blockchain::ALL {
            for n in [1, 58, 1_000_000, u64::MAX / 2] {
                let address = fake_address(blockchain, n);
                assert!(
                    blockchain.is_valid_address(&address),
                    "{} {}",
                    blockchain,
                    address
                );
            }
        }
        assert_ne!(
            fake_address(Blockchain::Tron, 1),
            fake_address(Blockchain::Tron, 2)
        );
    }

    #[tokio::test]
    async fn test_script_then_default_success() {
        let engine = MockProcessingClient::new();
        engine.fail_next_withdrawal(EngineError::DeadlineExceeded);

        let first = engine.funds_withdrawal(request(Blockchain::Bitcoin)).await;
        assert_eq!(first, Err(EngineError::DeadlineExceeded));

        let second = engine
            .funds_withdrawal(request(Blockchain::Bitcoin))
            .await
            .unwrap();
        assert!(second.tx_hash.unwrap().starts_with("0x"));
        assert_eq!(engine.withdrawal_count(), 2);
        assert_eq!(engine.peak_in_flight(Blockchain::Bitcoin), 1);
    }

    #[tokio::test]
    async fn test_processing_wallet_is_stable() {
        let engine = MockProcessingClient::new();
        let owner = Uuid::new_v4();
        let a = engine
            .get_owner_processing_wallet(owner, Blockchain::Tron)
            .await
            .unwrap();
        let b = engine
            .get_owner_processing_wallet(owner, Blockchain::Tron)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(engine.processing_wallet_calls(), 2);

        engine.set_processing_wallet_error(Some(EngineError::Unavailable("down".into())));
        assert!(
            engine
                .get_owner_processing_wallet(owner, Blockchain::Tron)
                .await
                .is_err()
        );
    }
}
