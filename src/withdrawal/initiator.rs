//! Transfer Initiator
//!
//! One funds-movement attempt: build the engine request, classify the
//! result and persist the outcome.
//!
//! | Outcome | Record |
//! |---|---|
//! | local validation failure | failed transfer, no engine call |
//! | [`Outcome::Retry`] | none, error returned |
//! | [`Outcome::Failure`] | failed transfer |
//! | [`Outcome::Success`] | new transfer |

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::WithdrawalError;
use crate::core_types::TransferId;
use crate::models::{
    Currency, Transfer, TransferKind, TransferStage, TransferStatus, User, settings,
};
use crate::processing::{
    FundsWithdrawalRequest, Outcome, ProcessingClient, TransferKindHint, WithdrawalAmount,
};
use crate::storage::{NewTransfer, Storage, StorageTx};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDto {
    /// Reused as the engine idempotency key; generated when `None`
    pub transfer_id: Option<TransferId>,
    pub kind: TransferKind,
    pub currency: Currency,
    pub from_addresses: Vec<String>,
    pub to_address: String,
    /// Swept balance for `from_address`, requested amount for `from_processing`
    pub amount: Decimal,
    pub amount_usd: Decimal,
}

pub struct TransferInitiator {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ProcessingClient>,
}

impl TransferInitiator {
    pub fn new(storage: Arc<dyn Storage>, engine: Arc<dyn ProcessingClient>) -> Self {
        Self { storage, engine }
    }

    /// Run one transfer attempt.
    ///
    /// The transfer row is written into `tx` when given, so the caller can
    /// commit it together with its own bookkeeping. A returned transfer may
    /// be `failed`; retryable outcomes return an error and write nothing.
    pub async fn initiate(
        &self,
        dto: TransferDto,
        user: &User,
        tx: Option<&mut dyn StorageTx>,
    ) -> Result<Transfer, WithdrawalError> {
        let owner_id = user
            .processing_owner_id
            .ok_or(WithdrawalError::NoProcessingOwner(user.id))?;
        let transfer_id = dto.transfer_id.unwrap_or_else(Uuid::new_v4);
        let blockchain = dto.currency.blockchain;

        if let Some(reason) = validate(&dto) {
            warn!(transfer_id = %transfer_id, blockchain = %blockchain, reason = %reason, "Transfer rejected before engine call");
            let failed = new_transfer(transfer_id, user, &dto, TransferStatus::Failed, Some(reason));
            return self.persist(failed, tx).await;
        }

        let kind = if blockchain.requires_transfer_kind_hint() {
            Some(self.kind_hint(user).await?)
        } else {
            None
        };

        let amount = match dto.kind {
            TransferKind::FromAddress => WithdrawalAmount::Whole,
            TransferKind::FromProcessing => WithdrawalAmount::Exact(dto.amount),
        };

        let request = FundsWithdrawalRequest {
            owner_id,
            request_id: transfer_id,
            blockchain,
            from_addresses: dto.from_addresses.clone(),
            to_addresses: vec![dto.to_address.clone()],
            amount,
            contract_address: dto.currency.contract().to_string(),
            kind,
        };

        match Outcome::classify(self.engine.funds_withdrawal(request).await) {
            Outcome::Retry(reason) => {
                info!(transfer_id = %transfer_id, blockchain = %blockchain, reason = %reason, "Transfer deferred");
                Err(WithdrawalError::from_retry(reason))
            }
            Outcome::Failure(message) => {
                warn!(transfer_id = %transfer_id, blockchain = %blockchain, error = %message, "Transfer failed");
                let failed =
                    new_transfer(transfer_id, user, &dto, TransferStatus::Failed, Some(message));
                self.persist(failed, tx).await
            }
            Outcome::Success(receipt) => {
                info!(
                    transfer_id = %transfer_id,
                    blockchain = %blockchain,
                    tx_hash = receipt.tx_hash.as_deref().unwrap_or(""),
                    "Transfer initiated"
                );
                let created =
                    new_transfer(transfer_id, user, &dto, TransferStatus::New, receipt.message);
                self.persist(created, tx).await.inspect_err(|e| {
                    // The engine accepted the request; the id is its idempotency key.
                    error!(transfer_id = %transfer_id, error = %e, "Failed to record initiated transfer");
                })
            }
        }
    }

    async fn kind_hint(&self, user: &User) -> Result<TransferKindHint, WithdrawalError> {
        let setting = self
            .storage
            .get_user_setting(user.id, settings::TRON_TRANSFER_TYPE)
            .await?;
        Ok(match setting.as_deref() {
            Some(settings::TRANSFER_TYPE_RESOURCES) => TransferKindHint::Resources,
            _ => TransferKindHint::Burn,
        })
    }

    async fn persist(
        &self,
        transfer: NewTransfer,
        tx: Option<&mut dyn StorageTx>,
    ) -> Result<Transfer, WithdrawalError> {
        match tx {
            Some(tx) => Ok(tx.create_transfer(transfer).await?),
            None => {
                let mut own = self.storage.begin().await?;
                let created = own.create_transfer(transfer).await?;
                own.commit().await?;
                Ok(created)
            }
        }
    }
}

/// Reason the request must not reach the engine
fn validate(dto: &TransferDto) -> Option<String> {
    let blockchain = dto.currency.blockchain;
    if !blockchain.is_valid_address(&dto.to_address) {
        return Some(format!("invalid {} address: {}", blockchain, dto.to_address));
    }
    if dto.from_addresses.is_empty() {
        return Some("no source address".to_string());
    }
    if dto.kind == TransferKind::FromProcessing && dto.amount <= Decimal::ZERO {
        return Some(format!("invalid amount: {}", dto.amount));
    }
    None
}

fn new_transfer(
    id: TransferId,
    user: &User,
    dto: &TransferDto,
    status: TransferStatus,
    message: Option<String>,
) -> NewTransfer {
    let stage = if status.is_failed() {
        TransferStage::Failed
    } else {
        TransferStage::InProgress
    };
    NewTransfer {
        id,
        user_id: user.id,
        kind: dto.kind,
        stage,
        status,
        currency_id: dto.currency.id.clone(),
        blockchain: dto.currency.blockchain,
        from_addresses: dto.from_addresses.clone(),
        to_address: dto.to_address.clone(),
        amount: dto.amount,
        amount_usd: dto.amount_usd,
        message,
    }
}
