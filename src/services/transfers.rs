//! Resolution of outbound transfers (withdrawals and payouts).
//!
//! The synchronous provider response and the later `transfer.*` webhooks both
//! land here, so whichever arrives first wins and the other is a no-op.

use chrono::Utc;
use std::sync::Arc;

use crate::config::SettlementConfig;
use crate::domain::{
    OutboxCommand, SettlementStatus, Transaction, TransactionStatus, TransactionType,
};
use crate::ports::{
    LedgerRepository, OutboxRepository, SettlementRepository, Store, UnitOfWork,
};
use crate::provider::{ProviderError, TransferReceipt, TransferStatus};
use crate::services::ledger::{Ledger, LedgerError, Resolution};
use crate::services::outbox::OutboxSignal;
use crate::services::{Disposition, ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded { transfer_code: Option<String> },
    Pending { transfer_code: Option<String> },
    OtpRequired { transfer_code: Option<String> },
    /// The provider declined the transfer; no money moved.
    Failed { reason: String },
    Reversed { reason: String },
    /// The provider was unreachable or failed mid-request. The transfer may
    /// exist, so only a re-send under the same reference is safe.
    Undelivered { reason: String },
    /// The provider call timed out; the transfer may or may not exist.
    Unknown { reason: String },
}

impl TransferOutcome {
    pub fn from_receipt(receipt: &TransferReceipt) -> Self {
        let transfer_code = receipt.transfer_code.clone();
        let reason = || {
            receipt
                .message
                .clone()
                .unwrap_or_else(|| "transfer failed".to_string())
        };
        match receipt.status {
            TransferStatus::Success => TransferOutcome::Succeeded { transfer_code },
            TransferStatus::Pending => TransferOutcome::Pending { transfer_code },
            TransferStatus::OtpRequired => TransferOutcome::OtpRequired { transfer_code },
            TransferStatus::Failed => TransferOutcome::Failed { reason: reason() },
            TransferStatus::Reversed => TransferOutcome::Reversed { reason: reason() },
        }
    }

    pub fn from_error(error: &ProviderError) -> Self {
        match error {
            ProviderError::Unavailable(msg) => TransferOutcome::Undelivered { reason: msg.clone() },
            ProviderError::Rejected(msg) => TransferOutcome::Failed { reason: msg.clone() },
            ProviderError::Timeout(msg) => TransferOutcome::Unknown { reason: msg.clone() },
        }
    }

    fn terminal_status(&self) -> Option<TransactionStatus> {
        match self {
            TransferOutcome::Succeeded { .. } => Some(TransactionStatus::Success),
            TransferOutcome::Failed { .. } => Some(TransactionStatus::Failed),
            TransferOutcome::Reversed { .. } => Some(TransactionStatus::Reversed),
            _ => None,
        }
    }

    fn transfer_code(&self) -> Option<&str> {
        match self {
            TransferOutcome::Succeeded { transfer_code }
            | TransferOutcome::Pending { transfer_code }
            | TransferOutcome::OtpRequired { transfer_code } => transfer_code.as_deref(),
            _ => None,
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            TransferOutcome::Failed { reason }
            | TransferOutcome::Reversed { reason }
            | TransferOutcome::Undelivered { reason }
            | TransferOutcome::Unknown { reason } => Some(reason),
            _ => None,
        }
    }
}

pub struct TransferResolver {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    settlement: SettlementConfig,
    signal: OutboxSignal,
}

impl TransferResolver {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        settlement: SettlementConfig,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            store,
            ledger,
            settlement,
            signal,
        }
    }

    /// Applies a transfer outcome to the PENDING debit recorded under `reference`.
    pub async fn apply(&self, reference: &str, outcome: TransferOutcome) -> ServiceResult<Disposition> {
        let result = self.apply_inner(reference, &outcome).await;
        self.ledger.quarantine_on_inconsistency(result).await
    }

    async fn apply_inner(&self, reference: &str, outcome: &TransferOutcome) -> ServiceResult<Disposition> {
        let mut uow = self.store.begin().await?;
        let entry = uow
            .find_transaction(reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transfer {}", reference)))?;
        if !entry.kind.is_transfer() {
            return Err(ServiceError::Conflict(format!(
                "{} is a {} entry, not a transfer",
                reference, entry.kind
            )));
        }

        let Some(target) = outcome.terminal_status() else {
            return self.keep_pending(uow, &entry, outcome).await;
        };

        if entry.status == target {
            return Ok(Disposition::Duplicate);
        }
        if target == TransactionStatus::Success
            && matches!(entry.status, TransactionStatus::Failed | TransactionStatus::Reversed)
        {
            // The debit was already released, so the ledger no longer covers this money.
            tracing::error!(
                "Provider reports transfer {} succeeded after it was recorded {}",
                reference,
                entry.status
            );
            return Err(LedgerError::Inconsistency {
                party: entry.party,
                detail: format!(
                    "transfer {} succeeded at the provider but is {} in the ledger",
                    reference, entry.status
                ),
            }
            .into());
        }
        if !entry.status.can_resolve_to(target) {
            tracing::warn!(
                "Ignoring stale transfer outcome for {}: {} -> {}",
                reference,
                entry.status,
                target
            );
            return Ok(Disposition::Stale);
        }

        let resolution = self
            .ledger
            .resolve(uow.as_mut(), reference, target, outcome.transfer_code())
            .await?;
        if let Resolution::Unchanged(_) = resolution {
            return Ok(Disposition::Duplicate);
        }

        if entry.kind == TransactionType::Payout {
            self.settle_payout(uow.as_mut(), reference, outcome).await?;
        }

        uow.commit().await?;

        tracing::info!("Transfer {} resolved as {}", reference, target);
        Ok(Disposition::Processed)
    }

    async fn keep_pending(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        entry: &Transaction,
        outcome: &TransferOutcome,
    ) -> ServiceResult<Disposition> {
        if entry.status != TransactionStatus::Pending {
            return Ok(Disposition::Stale);
        }

        if let Some(code) = outcome.transfer_code() {
            self.ledger
                .attach_provider_reference(uow.as_mut(), &entry.reference, code)
                .await?;
        }

        let mut resend_at = None;
        if entry.kind == TransactionType::Payout {
            if let Some(mut settlement) = uow.lock_settlement_by_transfer(&entry.reference).await? {
                if let Some(code) = outcome.transfer_code() {
                    settlement.settlement_data.transfer_code = Some(code.to_string());
                }
                if let Some(reason) = outcome.reason() {
                    settlement.settlement_data.last_error = Some(reason.to_string());
                }
                settlement.status = SettlementStatus::Processing;
                uow.update_settlement(&settlement).await?;

                if matches!(outcome, TransferOutcome::Undelivered { .. })
                    && settlement.attempts < self.settlement.payout_max_attempts
                {
                    let at = Utc::now() + self.settlement.retry_delay(settlement.attempts);
                    uow.enqueue(
                        OutboxCommand::ExecutePayout {
                            settlement_id: settlement.id,
                        },
                        at,
                    )
                    .await?;
                    resend_at = Some(at);
                }
            }
        }

        uow.commit().await?;
        match outcome {
            TransferOutcome::Undelivered { reason } | TransferOutcome::Unknown { reason } => {
                tracing::warn!(
                    "Transfer {} not confirmed ({}); debit held pending",
                    entry.reference,
                    reason
                );
            }
            _ => {}
        }
        if let Some(at) = resend_at {
            self.signal.notify();
            tracing::info!("Transfer {} will be re-sent at {}", entry.reference, at);
        }
        Ok(Disposition::Processed)
    }

    /// Moves the settlement behind a payout to the transfer's final state.
    async fn settle_payout(
        &self,
        uow: &mut dyn UnitOfWork,
        reference: &str,
        outcome: &TransferOutcome,
    ) -> ServiceResult<()> {
        let Some(mut settlement) = uow.lock_settlement_by_transfer(reference).await? else {
            tracing::warn!("Payout {} has no settlement", reference);
            return Ok(());
        };

        match outcome {
            TransferOutcome::Succeeded { transfer_code } => {
                settlement.status = SettlementStatus::Success;
                settlement.settled_at = Some(Utc::now());
                settlement.settlement_data.last_error = None;
                if let Some(code) = transfer_code {
                    settlement.settlement_data.transfer_code = Some(code.clone());
                }
            }
            TransferOutcome::Failed { reason } | TransferOutcome::Reversed { reason } => {
                settlement.status = SettlementStatus::Failed;
                settlement.settlement_data.last_error = Some(reason.clone());
            }
            _ => return Ok(()),
        }

        uow.update_settlement(&settlement).await?;
        Ok(())
    }
}
