//! Per-blockchain sweep lock registry.
//!
//! Each blockchain owns one busy flag, created lazily in a DashMap and flipped
//! with compare-and-swap. Acquisition never waits: a busy chain means the
//! caller skips this cycle.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core_types::Blockchain;

/// Non-blocking mutual exclusion keyed by blockchain.
///
/// One instance is owned by the scheduler and shared by reference, so
/// independent schedulers (e.g. in tests) never see each other's flags.
#[derive(Debug, Default)]
pub struct BlockchainLockRegistry {
    flags: DashMap<Blockchain, Arc<AtomicBool>>,
}

/// Held while a sweep cycle runs; releases the blockchain on drop.
#[derive(Debug)]
pub struct BlockchainLockGuard {
    blockchain: Blockchain,
    flag: Arc<AtomicBool>,
}

impl BlockchainLockGuard {
    pub fn blockchain(&self) -> Blockchain {
        self.blockchain
    }
}

impl Drop for BlockchainLockGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl BlockchainLockRegistry {
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
        }
    }

    fn flag(&self, blockchain: Blockchain) -> Arc<AtomicBool> {
        // Fast path under the shard read guard, insert under the write guard.
        if let Some(flag) = self.flags.get(&blockchain) {
            return Arc::clone(flag.value());
        }
        let entry = self
            .flags
            .entry(blockchain)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        Arc::clone(entry.value())
    }

    /// Try to mark the blockchain busy.
    ///
    /// Returns `None` if another sweep cycle already holds it.
    pub fn try_acquire(&self, blockchain: Blockchain) -> Option<BlockchainLockGuard> {
        let flag = self.flag(blockchain);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BlockchainLockGuard { blockchain, flag })
    }

    /// Reset the flag without a guard.
    ///
    /// Only needed when a guard was leaked with `mem::forget`; dropping the
    /// guard does the same thing.
    pub fn release(&self, blockchain: Blockchain) {
        if let Some(flag) = self.flags.get(&blockchain) {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn is_locked(&self, blockchain: Blockchain) -> bool {
        self.flags
            .get(&blockchain)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Number of blockchains that have ever been locked
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_acquire_and_drop() {
        let registry = BlockchainLockRegistry::new();
        assert!(registry.is_empty());

        let guard = registry.try_acquire(Blockchain::Bitcoin).unwrap();
        assert_eq!(guard.blockchain(), Blockchain::Bitcoin);
        assert!(registry.is_locked(Blockchain::Bitcoin));
        assert!(registry.try_acquire(Blockchain::Bitcoin).is_none());

        drop(guard);
        assert!(!registry.is_locked(Blockchain::Bitcoin));
        assert!(registry.try_acquire(Blockchain::Bitcoin).is_some());
    }

    #[test]
    fn test_blockchains_are_independent() {
        let registry = BlockchainLockRegistry::new();
        let _btc = registry.try_acquire(Blockchain::Bitcoin).unwrap();
        let _tron = registry.try_acquire(Blockchain::Tron).unwrap();

        assert!(registry.try_acquire(Blockchain::Ethereum).is_some());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_explicit_release() {
        let registry = BlockchainLockRegistry::new();
        std::mem::forget(registry.try_acquire(Blockchain::Litecoin).unwrap());
        assert!(registry.is_locked(Blockchain::Litecoin));

        registry.release(Blockchain::Litecoin);
        assert!(!registry.is_locked(Blockchain::Litecoin));
        // Releasing an unknown chain is a no-op
        registry.release(Blockchain::Dogecoin);
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = BlockchainLockRegistry::new();
        let b = BlockchainLockRegistry::new();
        let _held = a.try_acquire(Blockchain::Tron).unwrap();
        assert!(b.try_acquire(Blockchain::Tron).is_some());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let registry = Arc::new(BlockchainLockRegistry::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(std::sync::Barrier::new(16));
        let attempted = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let winners = Arc::clone(&winners);
                let start = Arc::clone(&start);
                let attempted = Arc::clone(&attempted);
                thread::spawn(move || {
                    start.wait();
                    let guard = registry.try_acquire(Blockchain::Ethereum);
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Hold until every thread has tried
                    attempted.wait();
                    drop(guard);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
