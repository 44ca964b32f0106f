//! Order payment state machine: initialization, captures, failures, expiry
//! and refunds.
//!
//! Every transition runs inside one unit of work holding the order row lock,
//! and is written with a compare-and-set on the payment status it started from.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::domain::{
    Order, OrderStatus, OutboxCommand, Party, PaymentStatus, ProposedTransaction, SettlementMode,
    Transaction, TransactionStatus, TransactionType,
};
use crate::ports::{LedgerRepository, OrderRepository, OutboxRepository, SettlementRepository, Store};
use crate::provider::{ChargeRequest, ChargeStatus, PaymentProvider, ProviderError, RefundRequest, RefundStatus};
use crate::services::ledger::{Ledger, Resolution};
use crate::services::outbox::OutboxSignal;
use crate::services::{Disposition, ServiceError, ServiceResult};
use crate::validation::{self, ValidationError};

const EXPIRY_BATCH: i64 = 100;

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_uppercase()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializePayment {
    pub payment_method: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub order_id: Uuid,
    pub payment_reference: String,
    pub authorization_url: String,
    pub access_code: Option<String>,
}

/// A successful charge as reported by a webhook or a verify call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeCapture {
    pub payment_reference: String,
    pub provider_id: Option<String>,
    pub amount: BigDecimal,
    pub paid_at: Option<DateTime<Utc>>,
}

impl ChargeCapture {
    /// One ledger entry per provider charge, so a replay of the same charge
    /// maps to the same reference while a second partial charge does not.
    pub fn ledger_reference(&self) -> String {
        match &self.provider_id {
            Some(id) => format!("{}-{}", self.payment_reference, id),
            None => self.payment_reference.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundMethod {
    /// Back to the buyer's original payment instrument through the provider.
    #[default]
    Original,
    /// Credited to the buyer's wallet.
    Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundType {
    Full,
    Partial,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundCommand {
    pub amount: Option<BigDecimal>,
    pub reason: Option<String>,
    pub refund_type: Option<RefundType>,
    #[serde(default)]
    pub refund_method: RefundMethod,
}

impl RefundCommand {
    /// Amount to refund given what is still refundable on the order.
    fn resolve_amount(&self, refundable: &BigDecimal) -> Result<BigDecimal, ValidationError> {
        let amount = match (self.refund_type, &self.amount) {
            (Some(RefundType::Partial), None) => {
                return Err(ValidationError::new("amount", "is required for a partial refund"))
            }
            (Some(RefundType::Full), Some(amount)) if amount != refundable => {
                return Err(ValidationError::new(
                    "amount",
                    format!("a full refund is exactly {}", refundable),
                ))
            }
            (_, Some(amount)) => amount.clone(),
            (_, None) => refundable.clone(),
        };
        if &amount > refundable {
            return Err(ValidationError::new(
                "amount",
                format!("exceeds the refundable amount {}", refundable),
            ));
        }
        Ok(amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Processed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub order: Order,
    pub transactions: Vec<Transaction>,
}

pub struct PaymentService {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    ledger: Arc<Ledger>,
    settings: EngineSettings,
    signal: OutboxSignal,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        ledger: Arc<Ledger>,
        settings: EngineSettings,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            store,
            provider,
            ledger,
            settings,
            signal,
        }
    }

    /// Opens a provider charge session for a PENDING order and moves it to INITIATED.
    pub async fn initialize(&self, order_id: Uuid, request: InitializePayment) -> ServiceResult<PaymentSession> {
        if let Some(url) = &request.redirect_url {
            validation::validate_callback_url(url)?;
        }
        let payment_method = request
            .payment_method
            .as_deref()
            .map(validation::sanitize_string)
            .filter(|method| !method.is_empty());

        let order = {
            let mut uow = self.store.begin().await?;
            uow.find_order(order_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?
        };
        ensure_initializable(&order)?;
        validation::validate_email(&order.buyer_email)?;

        let reference = format!("PAY-{}-{}", order.reference, &short_id()[..8]);
        let charge = ChargeRequest {
            reference: reference.clone(),
            email: order.buyer_email.clone(),
            amount: order.total.clone(),
            currency: self.settings.currency.clone(),
            callback_url: request.redirect_url.clone(),
            metadata: serde_json::json!({
                "purpose": "order_payment",
                "orderId": order.id,
                "businessId": order.business_id,
            }),
        };
        let session = self.provider.initialize_charge(&charge).await?;

        let mut uow = self.store.begin().await?;
        let mut order = uow
            .lock_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
        ensure_initializable(&order)?;

        order.payment_status = PaymentStatus::Initiated;
        order.payment_reference = Some(reference.clone());
        order.payment_method = payment_method;
        order.initiated_at = Some(Utc::now());
        if !uow.save_order(&order, PaymentStatus::Pending).await? {
            return Err(ServiceError::Conflict(format!(
                "order {} changed while initializing payment",
                order.reference
            )));
        }
        uow.commit().await?;

        tracing::info!("Payment {} initiated for order {}", reference, order.reference);
        Ok(PaymentSession {
            order_id: order.id,
            payment_reference: reference,
            authorization_url: session.authorization_url,
            access_code: session.access_code,
        })
    }

    /// Asks the provider for the charge state and applies it.
    pub async fn verify(&self, payment_reference: &str) -> ServiceResult<Order> {
        validation::validate_reference("reference", payment_reference)?;

        let verification = self.provider.verify_charge(payment_reference).await?;
        match verification.status {
            ChargeStatus::Success => {
                let capture = ChargeCapture {
                    payment_reference: payment_reference.to_string(),
                    provider_id: verification.provider_id,
                    amount: verification.amount,
                    paid_at: verification.paid_at,
                };
                self.apply_charge_success(&capture).await?;
            }
            ChargeStatus::Failed | ChargeStatus::Abandoned => {
                let reason = verification
                    .gateway_response
                    .unwrap_or_else(|| "charge failed".to_string());
                self.apply_charge_failure(payment_reference, &reason).await?;
            }
            ChargeStatus::Pending => {}
        }

        let mut uow = self.store.begin().await?;
        uow.lock_order_by_payment_reference(payment_reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {}", payment_reference)))
    }

    /// Books a captured charge against its order.
    pub async fn apply_charge_success(&self, capture: &ChargeCapture) -> ServiceResult<Disposition> {
        let result = self.apply_charge_success_inner(capture).await;
        self.ledger.quarantine_on_inconsistency(result).await
    }

    async fn apply_charge_success_inner(&self, capture: &ChargeCapture) -> ServiceResult<Disposition> {
        validation::validate_amount("amount", &capture.amount)?;

        let mut uow = self.store.begin().await?;
        let mut order = uow
            .lock_order_by_payment_reference(&capture.payment_reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {}", capture.payment_reference)))?;

        let ledger_reference = capture.ledger_reference();
        if uow.find_transaction(&ledger_reference).await?.is_some() {
            return Ok(Disposition::Duplicate);
        }

        let expected = order.payment_status;
        if !expected.accepts_capture() {
            tracing::warn!(
                "Ignoring capture {} for order {} in {}",
                ledger_reference,
                order.reference,
                expected
            );
            return Ok(Disposition::Stale);
        }

        let mut entry = ProposedTransaction::credit(
            Party::platform(),
            TransactionType::OrderPayment,
            capture.amount.clone(),
            ledger_reference.clone(),
        )
        .for_order(order.id)
        .for_business(order.business_id)
        .with_description(format!("Payment for {}", order.reference))
        .with_metadata(serde_json::json!({ "paymentReference": capture.payment_reference }));
        if let Some(provider_id) = &capture.provider_id {
            entry = entry.with_provider_reference(provider_id.clone());
        }
        if let Some(buyer_id) = order.buyer_id {
            entry = entry.for_user(buyer_id);
        }
        self.ledger.append(uow.as_mut(), entry).await?;

        order.amount_paid = &order.amount_paid + &capture.amount;
        let next = order.status_after_captures();
        if !expected.can_transition_to(next) {
            return Ok(Disposition::Stale);
        }
        order.payment_status = next;
        if next == PaymentStatus::Paid {
            order.paid_at = Some(capture.paid_at.unwrap_or_else(Utc::now));
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Confirmed;
            }
        }
        if !uow.save_order(&order, expected).await? {
            return Ok(Disposition::Stale);
        }

        let settle = next == PaymentStatus::Paid && self.settings.settlement.auto_settle;
        if settle {
            uow.enqueue(OutboxCommand::SettleOrder { order_id: order.id }, Utc::now())
                .await?;
        }
        uow.commit().await?;
        if settle {
            self.signal.notify();
        }

        tracing::info!(
            "Captured {} for order {} ({} -> {})",
            capture.amount,
            order.reference,
            expected,
            next
        );
        Ok(Disposition::Processed)
    }

    pub async fn apply_charge_failure(&self, payment_reference: &str, reason: &str) -> ServiceResult<Disposition> {
        let mut uow = self.store.begin().await?;
        let mut order = uow
            .lock_order_by_payment_reference(payment_reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {}", payment_reference)))?;

        match order.payment_status {
            PaymentStatus::Failed => return Ok(Disposition::Duplicate),
            PaymentStatus::Initiated => {}
            other => {
                tracing::warn!(
                    "Ignoring charge failure for order {} in {}",
                    order.reference,
                    other
                );
                return Ok(Disposition::Stale);
            }
        }

        order.payment_status = PaymentStatus::Failed;
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Cancelled;
        }
        if !uow.save_order(&order, PaymentStatus::Initiated).await? {
            return Ok(Disposition::Stale);
        }
        uow.commit().await?;

        tracing::info!("Payment {} failed: {}", payment_reference, reason);
        Ok(Disposition::Processed)
    }

    /// Expires INITIATED orders older than the payment TTL. Returns how many moved.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let cutoff = now - self.settings.payment_ttl;
        let mut uow = self.store.begin().await?;
        let orders = uow.lock_stale_initiated_orders(cutoff, EXPIRY_BATCH).await?;

        let mut expired = 0;
        for mut order in orders {
            order.payment_status = PaymentStatus::Expired;
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Cancelled;
            }
            if uow.save_order(&order, PaymentStatus::Initiated).await? {
                expired += 1;
            }
        }
        uow.commit().await?;

        if expired > 0 {
            tracing::info!("Expired {} unpaid orders initiated before {}", expired, cutoff);
        }
        Ok(expired)
    }

    /// Refunds part or all of a paid order.
    pub async fn refund(&self, order_id: Uuid, command: RefundCommand) -> ServiceResult<PaymentSummary> {
        if let Some(amount) = &command.amount {
            validation::validate_amount("amount", amount)?;
        }
        let reason = command
            .reason
            .as_deref()
            .map(validation::sanitize_string)
            .unwrap_or_else(|| "Customer refund".to_string());
        validation::validate_max_len("reason", &reason, validation::REASON_MAX_LEN)?;

        let result = self.book_refund(order_id, &command, &reason).await;
        let booked = self.ledger.quarantine_on_inconsistency(result).await?;

        if let Some((reference, request)) = booked {
            self.submit_refund(&reference, &request).await?;
        }
        self.summary(order_id).await
    }

    /// Records the refund debit and the order's new amounts. Returns the
    /// provider request still to be sent for original-method refunds.
    async fn book_refund(
        &self,
        order_id: Uuid,
        command: &RefundCommand,
        reason: &str,
    ) -> ServiceResult<Option<(String, RefundRequest)>> {
        let mut uow = self.store.begin().await?;
        let mut order = uow
            .lock_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        if !order.payment_status.is_refundable() {
            return Err(ServiceError::Conflict(format!(
                "order {} is {} and cannot be refunded",
                order.reference, order.payment_status
            )));
        }

        let amount = command.resolve_amount(&order.refundable_amount())?;

        let settled_to_merchant = self.settings.settlement.mode == SettlementMode::MainBalance
            && uow.lock_settlement_for_order(order.id).await?.is_some();
        let holder = if settled_to_merchant {
            Party::business(order.business_id)
        } else {
            Party::platform()
        };

        let reference = format!("RFD-{}", short_id());
        let debit = ProposedTransaction::debit(holder, TransactionType::Refund, amount.clone(), reference.clone())
            .for_order(order.id)
            .for_business(order.business_id)
            .with_description(reason.to_string());

        let pending_request = match command.refund_method {
            RefundMethod::Wallet => {
                let buyer_id = order.buyer_id.ok_or_else(|| {
                    ValidationError::new("method", "wallet refunds need a registered buyer")
                })?;
                self.ledger.append(uow.as_mut(), debit.for_user(buyer_id)).await?;
                let credit = ProposedTransaction::credit(
                    Party::user(buyer_id),
                    TransactionType::Refund,
                    amount.clone(),
                    format!("{}-CR", reference),
                )
                .for_order(order.id)
                .for_business(order.business_id)
                .for_user(buyer_id)
                .with_description(reason.to_string());
                self.ledger.append(uow.as_mut(), credit).await?;
                None
            }
            RefundMethod::Original => {
                let transaction_reference = order.payment_reference.clone().ok_or_else(|| {
                    ServiceError::Conflict(format!("order {} has no payment reference", order.reference))
                })?;
                self.ledger.append(uow.as_mut(), debit.pending()).await?;
                Some(RefundRequest {
                    reference: reference.clone(),
                    transaction_reference,
                    amount: amount.clone(),
                    reason: reason.to_string(),
                })
            }
        };

        let expected = order.payment_status;
        order.amount_refunded = &order.amount_refunded + &amount;
        order.payment_status = order.status_after_refunds();
        if order.payment_status == PaymentStatus::Refunded {
            order.status = OrderStatus::Refunded;
        }
        if !uow.save_order(&order, expected).await? {
            return Err(ServiceError::Conflict(format!(
                "order {} changed while refunding",
                order.reference
            )));
        }
        uow.commit().await?;

        tracing::info!(
            "Refund {} of {} booked for order {} against {}",
            reference,
            amount,
            order.reference,
            holder
        );
        Ok(pending_request.map(|request| (reference, request)))
    }

    async fn submit_refund(&self, reference: &str, request: &RefundRequest) -> ServiceResult<()> {
        match self.provider.initiate_refund(request).await {
            Ok(receipt) => match receipt.status {
                RefundStatus::Processed => {
                    self.apply_refund_outcome(reference, RefundOutcome::Processed).await?;
                }
                RefundStatus::Pending => {}
                RefundStatus::Failed => {
                    let reason = "provider reported the refund as failed".to_string();
                    self.apply_refund_outcome(reference, RefundOutcome::Failed { reason: reason.clone() })
                        .await?;
                    return Err(ProviderError::Rejected(reason).into());
                }
            },
            Err(ProviderError::Timeout(msg)) => {
                tracing::warn!("Refund {} outcome unknown ({}); awaiting webhook", reference, msg);
            }
            Err(e) => {
                self.apply_refund_outcome(reference, RefundOutcome::Failed { reason: e.to_string() })
                    .await?;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Settles a PENDING refund debit. A failed refund is reversed and the
    /// order's refunded amount is rolled back.
    pub async fn apply_refund_outcome(&self, reference: &str, outcome: RefundOutcome) -> ServiceResult<Disposition> {
        let result = self.apply_refund_outcome_inner(reference, &outcome).await;
        self.ledger.quarantine_on_inconsistency(result).await
    }

    async fn apply_refund_outcome_inner(&self, reference: &str, outcome: &RefundOutcome) -> ServiceResult<Disposition> {
        let mut uow = self.store.begin().await?;
        let entry = uow
            .find_transaction(reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("refund {}", reference)))?;
        if entry.kind != TransactionType::Refund {
            return Err(ServiceError::Conflict(format!("{} is not a refund", reference)));
        }

        let target = match outcome {
            RefundOutcome::Processed => TransactionStatus::Success,
            RefundOutcome::Failed { .. } => TransactionStatus::Failed,
        };
        if entry.status == target {
            return Ok(Disposition::Duplicate);
        }
        if !entry.status.can_resolve_to(target) {
            return Ok(Disposition::Stale);
        }

        let order = match entry.order_id {
            Some(order_id) => uow.lock_order(order_id).await?,
            None => None,
        };

        if let Resolution::Unchanged(_) = self.ledger.resolve(uow.as_mut(), reference, target, None).await? {
            return Ok(Disposition::Duplicate);
        }

        if let (RefundOutcome::Failed { reason }, Some(mut order)) = (outcome, order) {
            let expected = order.payment_status;
            order.amount_refunded = &order.amount_refunded - &entry.amount;
            order.payment_status = order.status_after_refunds();
            if order.status == OrderStatus::Refunded {
                order.status = OrderStatus::Confirmed;
            }
            if expected != order.payment_status && !expected.can_transition_to(order.payment_status) {
                return Err(ServiceError::Conflict(format!(
                    "order {} cannot return from {} to {}",
                    order.reference, expected, order.payment_status
                )));
            }
            if !uow.save_order(&order, expected).await? {
                return Err(ServiceError::Conflict(format!(
                    "order {} changed while reversing refund",
                    order.reference
                )));
            }
            tracing::warn!("Refund {} failed for order {}: {}", reference, order.reference, reason);
        }

        uow.commit().await?;
        Ok(Disposition::Processed)
    }

    /// Fulfillment transitions requested by the merchant.
    pub async fn update_status(&self, order_id: Uuid, next: OrderStatus) -> ServiceResult<Order> {
        let mut uow = self.store.begin().await?;
        let mut order = uow
            .lock_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        if order.status == next {
            return Ok(order);
        }
        if !order.status.can_transition_to(next) {
            return Err(ServiceError::Conflict(format!(
                "order {} cannot move from {} to {}",
                order.reference, order.status, next
            )));
        }
        let needs_payment = matches!(
            next,
            OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered
        );
        if needs_payment
            && !matches!(
                order.payment_status,
                PaymentStatus::Paid | PaymentStatus::PartiallyRefunded
            )
        {
            return Err(ServiceError::Conflict(format!(
                "order {} is {} and cannot be fulfilled",
                order.reference, order.payment_status
            )));
        }

        let previous = order.status;
        order.status = next;
        if !uow.save_order(&order, order.payment_status).await? {
            return Err(ServiceError::Conflict(format!(
                "order {} changed while updating status",
                order.reference
            )));
        }
        uow.commit().await?;

        tracing::info!("Order {} moved {} -> {}", order.reference, previous, next);
        Ok(order)
    }

    pub async fn summary(&self, order_id: Uuid) -> ServiceResult<PaymentSummary> {
        let mut uow = self.store.begin().await?;
        let order = uow
            .find_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
        let transactions = uow.order_transactions(order_id).await?;
        Ok(PaymentSummary { order, transactions })
    }
}

fn ensure_initializable(order: &Order) -> ServiceResult<()> {
    match order.payment_status {
        PaymentStatus::Pending => Ok(()),
        PaymentStatus::Initiated => Err(ServiceError::Conflict(format!(
            "payment already initiated as {}",
            order.payment_reference.as_deref().unwrap_or("unknown")
        ))),
        other => Err(ServiceError::Conflict(format!(
            "order {} is {} and cannot start a payment",
            order.reference, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reference_includes_provider_id() {
        let mut capture = ChargeCapture {
            payment_reference: "PAY-ORD-1-AB".into(),
            provider_id: Some("3301".into()),
            amount: BigDecimal::from(100),
            paid_at: None,
        };
        assert_eq!(capture.ledger_reference(), "PAY-ORD-1-AB-3301");
        capture.provider_id = None;
        assert_eq!(capture.ledger_reference(), "PAY-ORD-1-AB");
    }

    #[test]
    fn test_refund_method_defaults_to_original() {
        let command: RefundCommand = serde_json::from_str(r#"{"amount":"10.00"}"#).unwrap();
        assert_eq!(command.refund_method, RefundMethod::Original);
        let command: RefundCommand = serde_json::from_str(r#"{"refundMethod":"wallet"}"#).unwrap();
        assert_eq!(command.refund_method, RefundMethod::Wallet);
    }

    #[test]
    fn test_refund_amount_resolution() {
        let refundable = BigDecimal::from(10000);
        let command = |json: &str| serde_json::from_str::<RefundCommand>(json).unwrap();

        assert_eq!(
            command(r#"{"refundType":"full"}"#).resolve_amount(&refundable).unwrap(),
            refundable
        );
        assert_eq!(
            command(r#"{"refundType":"partial","amount":"5000"}"#)
                .resolve_amount(&refundable)
                .unwrap(),
            BigDecimal::from(5000)
        );
        assert!(command(r#"{"refundType":"partial"}"#).resolve_amount(&refundable).is_err());
        assert!(command(r#"{"refundType":"full","amount":"5000"}"#)
            .resolve_amount(&refundable)
            .is_err());
        assert!(command(r#"{"amount":"11000"}"#).resolve_amount(&refundable).is_err());
    }

    #[test]
    fn test_only_pending_orders_initialize() {
        let mut order = Order::new(Uuid::new_v4(), "a@b.co", BigDecimal::from(10));
        assert!(ensure_initializable(&order).is_ok());
        order.payment_status = PaymentStatus::Initiated;
        order.payment_reference = Some("PAY-1".into());
        let err = ensure_initializable(&order).unwrap_err();
        assert!(err.to_string().contains("PAY-1"));
    }
}
