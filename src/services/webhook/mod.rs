//! Provider webhook processing: verify, parse, dedupe, dispatch.
//!
//! Domain failures are dead-lettered and acknowledged so the provider stops
//! re-delivering; infrastructure failures are returned so it tries again.

pub mod events;
pub mod signature;

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{PaymentStatus, TransactionStatus, WebhookFailure};
use crate::ports::{
    LedgerRepository, OrderRepository, RepositoryError, Store, WebhookDlqRepository,
};
use crate::services::payments::{PaymentService, RefundOutcome};
use crate::services::transfers::{TransferOutcome, TransferResolver};
use crate::services::wallet::WalletService;
use crate::services::{Disposition, ServiceError};
use crate::validation::ValidationError;

pub use events::WebhookEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Processed,
    Duplicate,
    Ignored,
    DeadLettered(Uuid),
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("webhook failure {0} not found")]
    NotFound(Uuid),

    #[error("webhook processing failed: {0}")]
    Infrastructure(#[from] ServiceError),
}

impl From<RepositoryError> for WebhookError {
    fn from(err: RepositoryError) -> Self {
        WebhookError::Infrastructure(err.into())
    }
}

/// A handler failure that replaying unchanged would not fix.
struct Rejected {
    event: String,
    reference: Option<String>,
    error: String,
}

enum Failure {
    Rejected(Rejected),
    Infrastructure(ServiceError),
}

pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    secret: String,
    payments: Arc<PaymentService>,
    wallets: Arc<WalletService>,
    transfers: Arc<TransferResolver>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        secret: String,
        payments: Arc<PaymentService>,
        wallets: Arc<WalletService>,
        transfers: Arc<TransferResolver>,
    ) -> Self {
        Self {
            store,
            secret,
            payments,
            wallets,
            transfers,
        }
    }

    pub async fn handle(&self, raw: &[u8], signature_header: Option<&str>) -> Result<ProcessingResult, WebhookError> {
        if let Err(e) = signature::verify(&self.secret, raw, signature_header) {
            tracing::warn!(
                security = true,
                body_size = raw.len(),
                "Rejected webhook: {}",
                e
            );
            return Err(WebhookError::InvalidSignature);
        }

        match self.process(raw).await {
            Ok(result) => Ok(result),
            Err(Failure::Infrastructure(e)) => {
                tracing::error!("Webhook processing failed, provider will retry: {}", e);
                Err(WebhookError::Infrastructure(e))
            }
            Err(Failure::Rejected(rejected)) => self.dead_letter(raw, rejected).await,
        }
    }

    /// Runs a dead-lettered event again. The signature was checked at receipt.
    pub async fn replay(&self, failure_id: Uuid) -> Result<ProcessingResult, WebhookError> {
        let failure = {
            let mut uow = self.store.begin().await?;
            uow.find_webhook_failure(failure_id)
                .await?
                .ok_or(WebhookError::NotFound(failure_id))?
        };

        let outcome = self.process(failure.payload.as_bytes()).await;

        let mut uow = self.store.begin().await?;
        let mut failure = uow
            .find_webhook_failure(failure_id)
            .await?
            .ok_or(WebhookError::NotFound(failure_id))?;
        failure.attempts += 1;
        failure.updated_at = Utc::now();

        let result = match outcome {
            Ok(result) => {
                failure.replayed_at = Some(Utc::now());
                tracing::info!("Replayed webhook {} ({}): {:?}", failure.id, failure.event, result);
                Ok(result)
            }
            Err(Failure::Rejected(rejected)) => {
                tracing::warn!("Replay of webhook {} failed again: {}", failure.id, rejected.error);
                failure.error = rejected.error;
                Ok(ProcessingResult::DeadLettered(failure.id))
            }
            Err(Failure::Infrastructure(e)) => return Err(WebhookError::Infrastructure(e)),
        };

        uow.save_webhook_failure(&failure).await?;
        uow.commit().await?;
        result
    }

    pub async fn failures(&self, include_replayed: bool, limit: i64) -> Result<Vec<WebhookFailure>, WebhookError> {
        let mut uow = self.store.begin().await?;
        Ok(uow
            .list_webhook_failures(include_replayed, limit.clamp(1, 500))
            .await?)
    }

    async fn process(&self, raw: &[u8]) -> Result<ProcessingResult, Failure> {
        let event = WebhookEvent::parse(raw).map_err(|e| {
            Failure::Rejected(Rejected {
                event: e.event.clone(),
                reference: None,
                error: e.to_string(),
            })
        })?;

        if let WebhookEvent::Unknown(name) = &event {
            tracing::info!("Ignoring webhook event {}", name);
            return Ok(ProcessingResult::Ignored);
        }

        let classify = |e: ServiceError| {
            if e.is_infrastructure() {
                Failure::Infrastructure(e)
            } else {
                Failure::Rejected(Rejected {
                    event: event.name().to_string(),
                    reference: event.reference().map(str::to_string),
                    error: e.to_string(),
                })
            }
        };

        if self.already_applied(&event).await.map_err(|e| classify(e.into()))? {
            tracing::debug!("Duplicate webhook {} for {:?}", event.name(), event.reference());
            return Ok(ProcessingResult::Duplicate);
        }

        match self.dispatch(&event).await.map_err(classify)? {
            Disposition::Duplicate => Ok(ProcessingResult::Duplicate),
            Disposition::Processed | Disposition::Stale => {
                tracing::info!("Processed webhook {} for {:?}", event.name(), event.reference());
                Ok(ProcessingResult::Processed)
            }
        }
    }

    /// Cheap check that the state this event would produce is already stored.
    async fn already_applied(&self, event: &WebhookEvent) -> Result<bool, RepositoryError> {
        let mut uow = self.store.begin().await?;
        Ok(match event {
            WebhookEvent::ChargeSuccess(charge) => match charge.capture() {
                Some(capture) => uow.find_transaction(&capture.ledger_reference()).await?.is_some(),
                None => false,
            },
            WebhookEvent::ChargeFailed(charge) => uow
                .lock_order_by_payment_reference(&charge.reference)
                .await?
                .map_or(false, |order| order.payment_status == PaymentStatus::Failed),
            WebhookEvent::TransferSuccess(t) => {
                status_of(uow.find_transaction(&t.reference).await?) == Some(TransactionStatus::Success)
            }
            WebhookEvent::TransferFailed(t) => {
                status_of(uow.find_transaction(&t.reference).await?) == Some(TransactionStatus::Failed)
            }
            WebhookEvent::TransferReversed(t) => {
                status_of(uow.find_transaction(&t.reference).await?) == Some(TransactionStatus::Reversed)
            }
            WebhookEvent::RefundProcessed(r) => {
                status_of(uow.find_transaction(&r.reference).await?) == Some(TransactionStatus::Success)
            }
            WebhookEvent::RefundFailed(r) => {
                status_of(uow.find_transaction(&r.reference).await?) == Some(TransactionStatus::Failed)
            }
            WebhookEvent::Unknown(_) => false,
        })
    }

    async fn dispatch(&self, event: &WebhookEvent) -> Result<Disposition, ServiceError> {
        match event {
            WebhookEvent::ChargeSuccess(charge) => {
                let capture = charge.capture().ok_or_else(|| {
                    ValidationError::new("amount", "charge.success without an amount")
                })?;
                match charge.funding_party() {
                    Some(party) => {
                        let party = party.map_err(|e| ValidationError::new("metadata", e))?;
                        self.wallets.apply_funding(party, &capture).await
                    }
                    None => self.payments.apply_charge_success(&capture).await,
                }
            }
            WebhookEvent::ChargeFailed(charge) => {
                let reason = charge
                    .gateway_response
                    .clone()
                    .unwrap_or_else(|| "charge failed".to_string());
                self.payments.apply_charge_failure(&charge.reference, &reason).await
            }
            WebhookEvent::TransferSuccess(t) => {
                self.transfers
                    .apply(
                        &t.reference,
                        TransferOutcome::Succeeded {
                            transfer_code: t.transfer_code.clone(),
                        },
                    )
                    .await
            }
            WebhookEvent::TransferFailed(t) => {
                self.transfers
                    .apply(
                        &t.reference,
                        TransferOutcome::Failed {
                            reason: t.reason.clone().unwrap_or_else(|| "transfer failed".to_string()),
                        },
                    )
                    .await
            }
            WebhookEvent::TransferReversed(t) => {
                self.transfers
                    .apply(
                        &t.reference,
                        TransferOutcome::Reversed {
                            reason: t.reason.clone().unwrap_or_else(|| "transfer reversed".to_string()),
                        },
                    )
                    .await
            }
            WebhookEvent::RefundProcessed(r) => {
                self.payments
                    .apply_refund_outcome(&r.reference, RefundOutcome::Processed)
                    .await
            }
            WebhookEvent::RefundFailed(r) => {
                self.payments
                    .apply_refund_outcome(
                        &r.reference,
                        RefundOutcome::Failed {
                            reason: r.reason.clone().unwrap_or_else(|| "refund failed".to_string()),
                        },
                    )
                    .await
            }
            WebhookEvent::Unknown(_) => Ok(Disposition::Duplicate),
        }
    }

    async fn dead_letter(&self, raw: &[u8], rejected: Rejected) -> Result<ProcessingResult, WebhookError> {
        let failure = WebhookFailure::new(
            rejected.event,
            rejected.reference,
            String::from_utf8_lossy(raw).into_owned(),
            rejected.error,
        );

        let mut uow = self.store.begin().await?;
        uow.record_webhook_failure(&failure).await?;
        uow.commit().await?;

        tracing::warn!(
            "Webhook {} for {:?} dead-lettered as {}: {}",
            failure.event,
            failure.reference,
            failure.id,
            failure.error
        );
        Ok(ProcessingResult::DeadLettered(failure.id))
    }
}

fn status_of(entry: Option<crate::domain::Transaction>) -> Option<TransactionStatus> {
    entry.map(|t| t.status)
}
