//! Processing Withdrawal Queue
//!
//! Merchant withdrawals from the processing wallet are recorded first and
//! executed by the scheduler. Each drain runs in one storage transaction:
//! queued rows are locked, a transfer is initiated per row, and the row is
//! linked to its transfer on commit.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::CycleReport;
use super::error::WithdrawalError;
use super::initiator::{TransferDto, TransferInitiator};
use crate::models::{
    Transfer, TransferKind, User, WithdrawalFromProcessingWallet, settings,
};
use crate::processing::ProcessingClient;
use crate::rates::{ConvertParams, CurrencyRateProvider, USD};
use crate::storage::{NewProcessingWithdrawal, QueuedWithdrawal, Storage, StorageTx, StoreError};

/// Decimal places of USD valuations
const USD_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub currency_id: String,
    /// Caller-chosen idempotency key
    pub request_id: String,
    pub to_address: String,
    pub amount: Decimal,
}

pub struct ProcessingWithdrawalQueue {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ProcessingClient>,
    rates: Arc<dyn CurrencyRateProvider>,
    initiator: Arc<TransferInitiator>,
}

impl ProcessingWithdrawalQueue {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ProcessingClient>,
        rates: Arc<dyn CurrencyRateProvider>,
        initiator: Arc<TransferInitiator>,
    ) -> Self {
        Self {
            storage,
            engine,
            rates,
            initiator,
        }
    }

    /// Record a withdrawal request for the next drain
    pub async fn enqueue(
        &self,
        user: &User,
        request: EnqueueRequest,
    ) -> Result<WithdrawalFromProcessingWallet, WithdrawalError> {
        self.ensure_enabled(user).await?;

        if request.amount <= Decimal::ZERO {
            return Err(WithdrawalError::InvalidAmount(request.amount));
        }
        let currency = self.storage.get_currency(&request.currency_id).await?;
        if !currency.blockchain.is_valid_address(&request.to_address) {
            return Err(WithdrawalError::InvalidAddress {
                blockchain: currency.blockchain,
                address: request.to_address,
            });
        }
        if self
            .storage
            .processing_withdrawal_exists(&request.request_id)
            .await?
        {
            return Err(WithdrawalError::DuplicateRequest(request.request_id));
        }

        let request_id = request.request_id.clone();
        let created = self
            .storage
            .create_processing_withdrawal(NewProcessingWithdrawal {
                user_id: user.id,
                currency_id: currency.id,
                request_id: request.request_id,
                to_address: request.to_address,
                amount: request.amount,
            })
            .await
            .map_err(|e| match e {
                // Lost the race against a concurrent enqueue
                StoreError::Duplicate(_) => WithdrawalError::DuplicateRequest(request_id),
                other => other.into(),
            })?;

        info!(
            id = %created.id,
            user_id = %user.id,
            currency = %created.currency_id,
            amount = %created.amount,
            "Processing withdrawal queued"
        );
        Ok(created)
    }

    /// Initiate a transfer for every queued request.
    ///
    /// Rows that hit a transient condition stay queued; rows that produced a
    /// transfer, failed or not, are linked and leave the queue.
    pub async fn drain(&self) -> Result<CycleReport, WithdrawalError> {
        let mut tx = self.storage.begin().await?;
        let queued = match tx.get_queued_processing_withdrawals().await {
            Ok(queued) => queued,
            Err(e) => {
                rollback(tx).await;
                return Err(e.into());
            }
        };

        let mut report = CycleReport::default();
        if queued.is_empty() {
            rollback(tx).await;
            return Ok(report);
        }

        for item in queued {
            let id = item.request.id;
            let result = self.process(item, &mut *tx).await;
            match &result {
                Err(e) if e.is_expected() => {
                    debug!(id = %id, reason = %e, "Processing withdrawal skipped");
                }
                Err(e) if e.is_retryable() => {
                    info!(id = %id, reason = %e, "Processing withdrawal deferred");
                }
                Err(e) => {
                    error!(id = %id, error = %e, code = e.code(), "Processing withdrawal error");
                }
                Ok(_) => {}
            }
            report.record(&result);
        }

        tx.commit().await?;
        if report.transfers() > 0 {
            info!(
                initiated = report.initiated,
                failed = report.failed,
                deferred = report.deferred,
                "Processing withdrawal queue drained"
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        item: QueuedWithdrawal,
        tx: &mut dyn StorageTx,
    ) -> Result<Transfer, WithdrawalError> {
        let QueuedWithdrawal {
            request,
            user,
            currency,
        } = item;
        self.ensure_enabled(&user).await?;
        let owner_id = user
            .processing_owner_id
            .ok_or(WithdrawalError::NoProcessingOwner(user.id))?;

        let amount_usd = self
            .rates
            .convert(ConvertParams {
                source: &user.rate_source,
                from: &currency.code,
                to: USD,
                amount: request.amount,
                is_stable_coin: currency.is_stablecoin,
                scale: Some(USD_SCALE),
            })
            .await?;

        let from_address = self
            .engine
            .get_owner_processing_wallet(owner_id, currency.blockchain)
            .await?;

        let dto = TransferDto {
            transfer_id: Some(request.id),
            kind: TransferKind::FromProcessing,
            currency,
            from_addresses: vec![from_address],
            to_address: request.to_address.clone(),
            amount: request.amount,
            amount_usd,
        };
        let transfer = self.initiator.initiate(dto, &user, Some(&mut *tx)).await?;

        tx.link_transfer_to_processing_withdrawal(request.id, transfer.id, Some(amount_usd))
            .await?;
        Ok(transfer)
    }

    async fn ensure_enabled(&self, user: &User) -> Result<(), WithdrawalError> {
        let setting = self
            .storage
            .get_user_setting(user.id, settings::WITHDRAW_FROM_PROCESSING)
            .await?;
        if setting.as_deref() == Some(settings::ENABLED) {
            Ok(())
        } else {
            Err(WithdrawalError::WithdrawalFromProcessingDisabled)
        }
    }
}

async fn rollback(tx: Box<dyn StorageTx>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}
