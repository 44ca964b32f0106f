mod common;

use chrono::{Duration as ChronoDuration, Utc};

use common::{engine, money};
use settlement_core::domain::{
    Flow, OrderStatus, Party, PaymentStatus, TransactionStatus, TransactionType,
};
use settlement_core::provider::{ChargeStatus, ChargeVerification, ProviderError, RefundReceipt, RefundStatus};
use settlement_core::services::payments::{
    ChargeCapture, InitializePayment, RefundCommand, RefundMethod, RefundOutcome, RefundType,
};
use settlement_core::services::{Disposition, ServiceError};

fn partial(amount: &str) -> RefundCommand {
    RefundCommand {
        amount: Some(money(amount)),
        reason: Some("Damaged item".to_string()),
        refund_type: Some(RefundType::Partial),
        refund_method: RefundMethod::Original,
    }
}

#[tokio::test]
async fn test_initialize_moves_order_to_initiated() {
    let t = engine();
    let (order, _) = t.seed_order("15000.00", "95").await;

    let session = t
        .engine
        .state
        .payments
        .initialize(
            order.id,
            InitializePayment {
                payment_method: Some("card".to_string()),
                redirect_url: Some("https://shop.example.com/return".to_string()),
            },
        )
        .await
        .unwrap();

    assert!(session
        .payment_reference
        .starts_with(&format!("PAY-{}-", order.reference)));
    assert!(session.authorization_url.contains(&session.payment_reference));

    let stored = t.order(order.id).await;
    assert_eq!(stored.payment_status, PaymentStatus::Initiated);
    assert_eq!(stored.payment_reference.as_deref(), Some(session.payment_reference.as_str()));
    assert_eq!(stored.payment_method.as_deref(), Some("card"));
    assert!(stored.initiated_at.is_some());

    let charges = t.provider.charges.lock().unwrap().clone();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].amount, money("15000.00"));
    assert_eq!(charges[0].metadata["purpose"], "order_payment");
}

#[tokio::test]
async fn test_initialize_twice_is_a_conflict() {
    let t = engine();
    let (order, _) = t.seed_order("100.00", "95").await;
    let payments = &t.engine.state.payments;

    let session = payments.initialize(order.id, InitializePayment::default()).await.unwrap();
    let again = payments.initialize(order.id, InitializePayment::default()).await;

    match again {
        Err(ServiceError::Conflict(msg)) => assert!(msg.contains(&session.payment_reference)),
        other => panic!("expected a conflict, got {:?}", other.map(|s| s.payment_reference)),
    }
}

#[tokio::test]
async fn test_initialize_rejects_bad_redirect() {
    let t = engine();
    let (order, _) = t.seed_order("100.00", "95").await;

    let result = t
        .engine
        .state
        .payments
        .initialize(
            order.id,
            InitializePayment {
                payment_method: None,
                redirect_url: Some("javascript:alert(1)".to_string()),
            },
        )
        .await;
    assert!(matches!(result, Err(ServiceError::Validation(_))));
    assert_eq!(t.order(order.id).await.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_verify_applies_provider_result() {
    let t = engine();
    let (order, _) = t.seed_order("4200.00", "95").await;
    let session = t
        .engine
        .state
        .payments
        .initialize(order.id, InitializePayment::default())
        .await
        .unwrap();

    let verification = |status| ChargeVerification {
        reference: session.payment_reference.clone(),
        provider_id: Some("771".to_string()),
        status,
        amount: money("4200.00"),
        paid_at: Some(Utc::now()),
        gateway_response: None,
    };

    t.provider.script_verification(Ok(verification(ChargeStatus::Pending)));
    let pending = t.engine.state.payments.verify(&session.payment_reference).await.unwrap();
    assert_eq!(pending.payment_status, PaymentStatus::Initiated);

    t.provider.script_verification(Ok(verification(ChargeStatus::Success)));
    let paid = t.engine.state.payments.verify(&session.payment_reference).await.unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    // Verifying again is harmless.
    t.provider.script_verification(Ok(verification(ChargeStatus::Success)));
    t.engine.state.payments.verify(&session.payment_reference).await.unwrap();
    let payments = t
        .entries(Party::platform())
        .await
        .into_iter()
        .filter(|e| e.kind == TransactionType::OrderPayment)
        .count();
    assert_eq!(payments, 1);
}

#[tokio::test]
async fn test_verify_surfaces_provider_outage() {
    let t = engine();
    t.provider
        .script_verification(Err(ProviderError::Unavailable("circuit open".into())));

    let result = t.engine.state.payments.verify("PAY-ORD-UNKNOWN").await;
    assert!(matches!(
        result,
        Err(ServiceError::Provider(ProviderError::Unavailable(_)))
    ));
}

#[tokio::test]
async fn test_partial_captures_accumulate() {
    let t = engine();
    let (order, _) = t.seed_order("15000.00", "95").await;
    let session = t
        .engine
        .state
        .payments
        .initialize(order.id, InitializePayment::default())
        .await
        .unwrap();

    let capture = |id: &str, amount: &str| ChargeCapture {
        payment_reference: session.payment_reference.clone(),
        provider_id: Some(id.to_string()),
        amount: money(amount),
        paid_at: None,
    };

    let payments = &t.engine.state.payments;
    assert_eq!(
        payments.apply_charge_success(&capture("1", "5000.00")).await.unwrap(),
        Disposition::Processed
    );
    assert_eq!(t.order(order.id).await.payment_status, PaymentStatus::PartiallyPaid);

    assert_eq!(
        payments.apply_charge_success(&capture("1", "5000.00")).await.unwrap(),
        Disposition::Duplicate
    );
    payments.apply_charge_success(&capture("2", "10000.00")).await.unwrap();

    let paid = t.order(order.id).await;
    assert_eq!(paid.payment_status, PaymentStatus::Paid);
    assert_eq!(paid.amount_paid, money("15000.00"));
    assert_eq!(t.balance(Party::platform()).await, money("15000.00"));
}

#[tokio::test]
async fn test_partial_then_excessive_refund() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let payments = &t.engine.state.payments;

    let summary = payments.refund(paid.order.id, partial("5000.00")).await.unwrap();
    assert_eq!(summary.order.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(summary.order.amount_refunded, money("5000.00"));

    let refunds: Vec<_> = summary
        .transactions
        .iter()
        .filter(|e| e.kind == TransactionType::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].flow, Flow::Debit);
    assert_eq!(refunds[0].amount, money("5000.00"));
    assert_eq!(refunds[0].status, TransactionStatus::Success);

    let excessive = payments.refund(paid.order.id, partial("11000.00")).await;
    assert!(matches!(excessive, Err(ServiceError::Validation(_))));

    let order = t.order(paid.order.id).await;
    assert_eq!(order.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(order.amount_refunded, money("5000.00"));
    assert_eq!(t.provider.refunds.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_refund_to_wallet() {
    let t = engine();
    let paid = t.seed_paid_order("2500.00", "95").await;

    let summary = t
        .engine
        .state
        .payments
        .refund(
            paid.order.id,
            RefundCommand {
                refund_type: Some(RefundType::Full),
                refund_method: RefundMethod::Wallet,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.order.payment_status, PaymentStatus::Refunded);
    assert_eq!(summary.order.status, OrderStatus::Refunded);
    assert_eq!(t.balance(Party::user(paid.buyer_id)).await, money("2500.00"));
    assert_eq!(t.balance(Party::platform()).await, money("0.00"));
    assert!(t.provider.refunds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_refund_is_rolled_back() {
    let t = engine();
    let paid = t.seed_paid_order("3000.00", "95").await;
    t.provider
        .script_refund(Err(ProviderError::Rejected("transaction not refundable".into())));

    let result = t.engine.state.payments.refund(paid.order.id, partial("1000.00")).await;
    assert!(matches!(result, Err(ServiceError::Provider(ProviderError::Rejected(_)))));

    let order = t.order(paid.order.id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.amount_refunded, money("0.00"));
    assert_eq!(t.balance(Party::platform()).await, money("3000.00"));

    let reversals = t
        .entries(Party::platform())
        .await
        .into_iter()
        .filter(|e| e.kind == TransactionType::Reversal)
        .count();
    assert_eq!(reversals, 1);
}

#[tokio::test]
async fn test_pending_refund_resolved_later() {
    let t = engine();
    let paid = t.seed_paid_order("3000.00", "95").await;
    t.provider.script_refund(Ok(RefundReceipt {
        reference: String::new(),
        status: RefundStatus::Pending,
    }));

    let summary = t.engine.state.payments.refund(paid.order.id, partial("3000.00")).await.unwrap();
    assert_eq!(summary.order.payment_status, PaymentStatus::Refunded);
    let refund = summary
        .transactions
        .iter()
        .find(|e| e.kind == TransactionType::Refund)
        .unwrap()
        .clone();
    assert_eq!(refund.status, TransactionStatus::Pending);

    let payments = &t.engine.state.payments;
    let failed = RefundOutcome::Failed {
        reason: "bank declined".to_string(),
    };
    assert_eq!(
        payments.apply_refund_outcome(&refund.reference, failed.clone()).await.unwrap(),
        Disposition::Processed
    );
    assert_eq!(
        payments.apply_refund_outcome(&refund.reference, failed).await.unwrap(),
        Disposition::Duplicate
    );

    let order = t.order(paid.order.id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(t.balance(Party::platform()).await, money("3000.00"));
}

#[tokio::test]
async fn test_refund_of_unpaid_order_is_a_conflict() {
    let t = engine();
    let (order, _) = t.seed_order("100.00", "95").await;

    let result = t.engine.state.payments.refund(order.id, partial("50.00")).await;
    assert!(matches!(result, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_stale_payments_expire() {
    let t = engine();
    let (order, _) = t.seed_order("900.00", "95").await;
    let session = t
        .engine
        .state
        .payments
        .initialize(order.id, InitializePayment::default())
        .await
        .unwrap();

    let payments = &t.engine.state.payments;
    assert_eq!(payments.expire_stale(Utc::now()).await.unwrap(), 0);
    assert_eq!(
        payments
            .expire_stale(Utc::now() + ChronoDuration::minutes(31))
            .await
            .unwrap(),
        1
    );

    let expired = t.order(order.id).await;
    assert_eq!(expired.payment_status, PaymentStatus::Expired);
    assert_eq!(expired.status, OrderStatus::Cancelled);

    // Money that arrives late is still booked.
    payments
        .apply_charge_success(&ChargeCapture {
            payment_reference: session.payment_reference,
            provider_id: Some("88".to_string()),
            amount: money("900.00"),
            paid_at: None,
        })
        .await
        .unwrap();
    assert_eq!(t.order(order.id).await.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn test_fulfillment_requires_payment() {
    let t = engine();
    let (order, _) = t.seed_order("100.00", "95").await;
    let payments = &t.engine.state.payments;

    let early = payments.update_status(order.id, OrderStatus::Confirmed).await;
    assert!(matches!(early, Err(ServiceError::Conflict(_))));

    let paid = t.seed_paid_order("100.00", "95").await;
    assert_eq!(paid.order.status, OrderStatus::Confirmed);
    let processing = payments
        .update_status(paid.order.id, OrderStatus::Processing)
        .await
        .unwrap();
    assert_eq!(processing.status, OrderStatus::Processing);

    let skipped = payments.update_status(paid.order.id, OrderStatus::Delivered).await;
    assert!(matches!(skipped, Err(ServiceError::Conflict(_))));
}
