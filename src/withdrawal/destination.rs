//! Destination continuity for scheduled sweeps.
//!
//! A hot address keeps sending to the approved destination it used before,
//! so recurring sweeps stay predictable without an explicit rule.

use std::sync::Arc;
use tracing::debug;

use super::error::WithdrawalError;
use super::rule::pick_random;
use crate::storage::Storage;

pub struct DestinationPicker {
    storage: Arc<dyn Storage>,
}

impl DestinationPicker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Previous approved destination of `from_address`, else a random one
    pub async fn pick(
        &self,
        from_address: &str,
        approved: &[String],
    ) -> Result<String, WithdrawalError> {
        if approved.is_empty() {
            return Err(WithdrawalError::EmptyApprovedAddresses);
        }

        if let Some(previous) = self
            .storage
            .find_previous_destination(from_address, approved)
            .await?
            && approved.contains(&previous)
        {
            debug!(from_address, to_address = %previous, "Reusing previous destination");
            return Ok(previous);
        }

        pick_random(approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Blockchain;
    use crate::models::TransactionRecord;
    use crate::storage::MemoryStorage;
    use chrono::{Duration, Utc};

    fn record(from: &str, to: &str, minutes_ago: i64) -> TransactionRecord {
        TransactionRecord {
            blockchain: Blockchain::Bitcoin,
            from_address: from.to_string(),
            to_address: to.to_string(),
            tx_hash: format!("{}-{}", from, to),
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn approved() -> Vec<String> {
        vec!["cold-a".to_string(), "cold-b".to_string(), "cold-c".to_string()]
    }

    #[tokio::test]
    async fn test_continuity_is_deterministic() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_transaction(record("hot-1", "cold-b", 60));
        let picker = DestinationPicker::new(storage);

        for _ in 0..50 {
            assert_eq!(picker.pick("hot-1", &approved()).await.unwrap(), "cold-b");
        }
    }

    #[tokio::test]
    async fn test_latest_approved_destination_wins() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_transaction(record("hot-1", "cold-a", 120));
        storage.insert_transaction(record("hot-1", "cold-c", 10));
        // Not approved any more
        storage.insert_transaction(record("hot-1", "cold-gone", 1));
        let picker = DestinationPicker::new(storage);

        assert_eq!(picker.pick("hot-1", &approved()).await.unwrap(), "cold-c");
    }

    #[tokio::test]
    async fn test_no_history_falls_back_to_random() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_transaction(record("hot-2", "cold-a", 5));
        let picker = DestinationPicker::new(storage);

        let approved = approved();
        let picked = picker.pick("hot-1", &approved).await.unwrap();
        assert!(approved.contains(&picked));
    }

    #[tokio::test]
    async fn test_empty_approved_list() {
        let picker = DestinationPicker::new(Arc::new(MemoryStorage::new()));
        assert_eq!(
            picker.pick("hot-1", &[]).await,
            Err(WithdrawalError::EmptyApprovedAddresses)
        );
    }
}
