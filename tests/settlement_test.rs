mod common;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use common::{engine, engine_with, money, settings, sign, TestEngine};
use settlement_core::domain::{
    Flow, Party, ProposedTransaction, SettlementMode, SettlementStatus, TransactionStatus,
    TransactionType, WalletState,
};
use settlement_core::ports::{SettlementRepository, Store};
use settlement_core::provider::ProviderError;
use settlement_core::services::settlement::SettlementFilter;
use settlement_core::services::{ProcessingResult, ServiceError};

fn sent_references(t: &TestEngine) -> Vec<String> {
    t.provider
        .transfers
        .lock()
        .unwrap()
        .iter()
        .map(|transfer| transfer.reference.clone())
        .collect()
}

fn transfer_event(event: &str, reference: &str) -> Vec<u8> {
    json!({ "event": event, "data": { "reference": reference } })
        .to_string()
        .into_bytes()
}

#[tokio::test]
async fn test_settlement_split_for_main_balance() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;

    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    assert_eq!(settlement.gross_amount, money("15000.00"));
    assert_eq!(settlement.platform_fee, money("750.00"));
    assert_eq!(settlement.net_amount, money("14250.00"));
    assert_eq!(settlement.status, SettlementStatus::Pending);
    assert_eq!(settlement.reference, format!("STL-{}", paid.order.reference));
    assert_eq!(settlement.account_number, paid.bank_account.account_number);

    let business = Party::business(paid.business_id);
    let credits = t.entries(business).await;
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].kind, TransactionType::Settlement);
    assert_eq!(credits[0].flow, Flow::Credit);
    assert_eq!(credits[0].net_amount, money("14250.00"));
    assert_eq!(credits[0].fee, money("750.00"));
    assert_eq!(t.balance(business).await, money("14250.00"));

    // The platform keeps only its fee.
    assert_eq!(t.balance(Party::platform()).await, money("750.00"));
}

#[tokio::test]
async fn test_settling_twice_returns_the_same_settlement() {
    let t = engine();
    let paid = t.seed_paid_order("5000.00", "90").await;

    let first = t.engine.state.settlements.settle(paid.order.id).await.unwrap();
    let second = t.engine.state.settlements.settle(paid.order.id).await.unwrap();
    assert_eq!(first.id, second.id);

    let listed = t
        .engine
        .state
        .settlements
        .list(&SettlementFilter {
            business_id: Some(paid.business_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(t.entries(Party::business(paid.business_id)).await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_settle_creates_one_row() {
    let t = engine();
    let paid = t.seed_paid_order("1200.00", "95").await;

    let settlements = &t.engine.state.settlements;
    let (a, b) = tokio::join!(settlements.settle(paid.order.id), settlements.settle(paid.order.id));
    assert_eq!(a.unwrap().id, b.unwrap().id);
    assert_eq!(t.entries(Party::business(paid.business_id)).await.len(), 1);
}

#[tokio::test]
async fn test_unpaid_order_does_not_settle() {
    let t = engine();
    let (order, _) = t.seed_order("1000.00", "95").await;

    let result = t.engine.state.settlements.settle(order.id).await;
    assert!(matches!(result, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_payout_succeeds_through_outbox() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    let report = t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    assert_eq!(report.completed, 1);

    let settlement = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(settlement.status, SettlementStatus::Success);
    assert_eq!(settlement.attempts, 1);
    assert!(settlement.settled_at.is_some());

    let transfer = t.provider.last_transfer().unwrap();
    assert_eq!(transfer.amount, money("14250.00"));
    assert_eq!(transfer.account_number, "0123456789");
    assert_eq!(Some(transfer.reference.clone()), settlement.transfer_reference);

    let payout = t.entry(&transfer.reference).await.unwrap();
    assert_eq!(payout.kind, TransactionType::Payout);
    assert_eq!(payout.status, TransactionStatus::Success);
    assert_eq!(t.balance(Party::business(paid.business_id)).await, money("0.00"));
}

#[tokio::test]
async fn test_unavailable_provider_resends_the_same_transfer() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let business = Party::business(paid.business_id);
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    t.provider
        .script_transfer(Err(ProviderError::Unavailable("provider returned 503".into())));
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();

    let held = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(held.status, SettlementStatus::Processing);
    assert!(held
        .settlement_data
        .last_error
        .as_deref()
        .unwrap()
        .contains("503"));
    let reference = held.transfer_reference.clone().unwrap();
    assert_eq!(t.entry(&reference).await.unwrap().status, TransactionStatus::Pending);

    // The debit stays reserved while the outcome is unknown.
    let balance = t.engine.state.wallets.balance(business).await.unwrap();
    assert_eq!(balance.available_balance, money("0.00"));
    assert_eq!(balance.ledger_balance, money("14250.00"));

    // The re-send is delayed by the backoff.
    let report = t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    assert_eq!(report.total(), 0);
    t.engine
        .outbox
        .drain_once(Utc::now() + ChronoDuration::minutes(5))
        .await
        .unwrap();

    let settled = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(settled.status, SettlementStatus::Success);
    assert_eq!(settled.attempts, 2);
    assert_eq!(settled.transfer_reference.as_deref(), Some(reference.as_str()));
    assert_eq!(sent_references(&t), vec![reference.clone(), reference.clone()]);

    let entries = t.entries(business).await;
    assert_eq!(
        entries.iter().filter(|e| e.kind == TransactionType::Payout).count(),
        1
    );
    assert!(entries.iter().all(|e| e.kind != TransactionType::Reversal));
    assert_eq!(t.entry(&reference).await.unwrap().status, TransactionStatus::Success);
    assert_eq!(t.balance(business).await, money("0.00"));
}

#[tokio::test]
async fn test_webhook_confirms_payout_before_resend() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    t.provider
        .script_transfer(Err(ProviderError::Unavailable("connection reset".into())));
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    let reference = t
        .engine
        .state
        .settlements
        .get(settlement.id)
        .await
        .unwrap()
        .transfer_reference
        .unwrap();

    let body = transfer_event("transfer.success", &reference);
    let result = t.engine.state.webhooks.handle(&body, Some(&sign(&body))).await.unwrap();
    assert_eq!(result, ProcessingResult::Processed);

    let report = t
        .engine
        .outbox
        .drain_once(Utc::now() + ChronoDuration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(t.provider.transfer_count(), 1);

    let settled = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(settled.status, SettlementStatus::Success);
    assert_eq!(t.balance(Party::business(paid.business_id)).await, money("0.00"));
}

#[tokio::test]
async fn test_success_after_recorded_failure_freezes_merchant_wallet() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let business = Party::business(paid.business_id);
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    t.provider
        .script_transfer(Err(ProviderError::Rejected("account name mismatch".into())));
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    let failed = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(failed.status, SettlementStatus::Failed);
    let reference = failed.transfer_reference.unwrap();
    assert_eq!(t.balance(business).await, money("14250.00"));

    let body = transfer_event("transfer.success", &reference);
    let result = t.engine.state.webhooks.handle(&body, Some(&sign(&body))).await.unwrap();
    assert!(matches!(result, ProcessingResult::DeadLettered(_)));

    let failures = t.engine.state.webhooks.failures(false, 10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reference.as_deref(), Some(reference.as_str()));

    let wallet = t.engine.state.wallets.balance(business).await.unwrap();
    assert_eq!(wallet.state, WalletState::Frozen);
    assert_eq!(t.entry(&reference).await.unwrap().status, TransactionStatus::Failed);
}

#[tokio::test]
async fn test_timed_out_payout_is_reconciled() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    t.provider
        .script_transfer(Err(ProviderError::Timeout("no response after 20s".into())));
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    t.engine
        .outbox
        .drain_once(Utc::now() + ChronoDuration::days(1))
        .await
        .unwrap();

    let stuck = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(stuck.status, SettlementStatus::Processing);
    assert_eq!(t.provider.transfer_count(), 1);

    let settlements = &t.engine.state.settlements;
    assert_eq!(settlements.reconcile_payouts(Utc::now()).await.unwrap(), 0);
    assert_eq!(
        settlements
            .reconcile_payouts(Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap(),
        1
    );

    let settled = settlements.get(settlement.id).await.unwrap();
    assert_eq!(settled.status, SettlementStatus::Success);
    let reference = stuck.transfer_reference.unwrap();
    assert_eq!(sent_references(&t), vec![reference.clone(), reference]);
    assert_eq!(t.balance(Party::business(paid.business_id)).await, money("0.00"));

    assert_eq!(
        settlements
            .reconcile_payouts(Utc::now() + ChronoDuration::hours(2))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_payout_booked_but_never_sent_is_reconciled() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let business = Party::business(paid.business_id);
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    // The debit and PROCESSING state are committed, then the process dies
    // before the provider is called.
    let reference = {
        let mut uow = t.store.begin().await.unwrap();
        let mut stored = uow.lock_settlement(settlement.id).await.unwrap().unwrap();
        let reference = stored.next_transfer_reference();
        let payout = ProposedTransaction::debit(
            business,
            TransactionType::Payout,
            stored.net_amount.clone(),
            reference.clone(),
        )
        .pending();
        t.engine
            .state
            .ledger
            .append(uow.as_mut(), payout)
            .await
            .unwrap();
        stored.attempts += 1;
        stored.status = SettlementStatus::Processing;
        stored.transfer_reference = Some(reference.clone());
        uow.update_settlement(&stored).await.unwrap();
        uow.commit().await.unwrap();
        reference
    };
    assert_eq!(t.provider.transfer_count(), 0);

    let resent = t
        .engine
        .state
        .settlements
        .reconcile_payouts(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(resent, 1);
    assert_eq!(sent_references(&t), vec![reference.clone()]);

    let settled = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(settled.status, SettlementStatus::Success);
    assert_eq!(t.entry(&reference).await.unwrap().status, TransactionStatus::Success);

    // The queued payout message finds nothing left to do.
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    assert_eq!(t.provider.transfer_count(), 1);
    assert_eq!(t.balance(business).await, money("0.00"));
}

#[tokio::test]
async fn test_rejected_payout_waits_for_operator_retry() {
    let t = engine();
    let paid = t.seed_paid_order("2000.00", "95").await;
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    t.provider
        .script_transfer(Err(ProviderError::Rejected("invalid account".into())));
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    t.engine
        .outbox
        .drain_once(Utc::now() + ChronoDuration::days(1))
        .await
        .unwrap();

    let failed = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(failed.status, SettlementStatus::Failed);
    assert_eq!(t.provider.transfer_count(), 1);

    let queued = t.engine.state.settlements.retry(settlement.id).await.unwrap();
    assert_eq!(queued.status, SettlementStatus::Pending);
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();

    let settled = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(settled.status, SettlementStatus::Success);
    assert_eq!(settled.attempts, 2);
}

#[tokio::test]
async fn test_retry_requires_failed_settlement() {
    let t = engine();
    let paid = t.seed_paid_order("2000.00", "95").await;
    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();

    let result = t.engine.state.settlements.retry(settlement.id).await;
    assert!(matches!(result, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_auto_settle_after_capture() {
    let mut settings = settings(SettlementMode::MainBalance);
    settings.settlement.auto_settle = true;
    let t = engine_with(settings);
    let paid = t.seed_paid_order("10000.00", "80").await;

    // Settle, then pay out.
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    t.engine.outbox.drain_once(Utc::now()).await.unwrap();

    let settlements = t
        .engine
        .state
        .settlements
        .list(&SettlementFilter::default())
        .await
        .unwrap();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].order_id, Some(paid.order.id));
    assert_eq!(settlements[0].platform_fee, money("2000.00"));
    assert_eq!(settlements[0].status, SettlementStatus::Success);
}

#[tokio::test]
async fn test_subaccount_settlement_books_no_merchant_credit() {
    let t = engine_with(settings(SettlementMode::Subaccount));
    let paid = t.seed_paid_order("15000.00", "95").await;

    let settlement = t.engine.state.settlements.settle(paid.order.id).await.unwrap();
    assert_eq!(settlement.status, SettlementStatus::Processing);
    assert_eq!(
        settlement.settlement_data.subaccount_code.as_deref(),
        Some("ACCT_sub_test")
    );
    assert!(t.entries(Party::business(paid.business_id)).await.is_empty());
    assert_eq!(t.balance(Party::platform()).await, money("750.00"));

    let report = t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(t.provider.transfer_count(), 0);

    let confirmed = t
        .engine
        .state
        .settlements
        .confirm_subaccount(settlement.id)
        .await
        .unwrap();
    assert_eq!(confirmed.status, SettlementStatus::Success);
    assert!(confirmed.settled_at.is_some());
}

#[tokio::test]
async fn test_sweep_pays_out_available_balance() {
    let t = engine();
    let paid = t.seed_paid_order("3000.00", "95").await;
    let business = Party::business(paid.business_id);
    t.fund(business, "500.00").await;

    let settlement = t.engine.state.settlements.sweep(paid.business_id).await.unwrap();
    assert_eq!(settlement.net_amount, money("500.00"));
    assert_eq!(settlement.order_id, None);
    assert!(settlement.reference.starts_with("STL-SWP-"));

    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    let settled = t.engine.state.settlements.get(settlement.id).await.unwrap();
    assert_eq!(settled.status, SettlementStatus::Success);
    assert_eq!(t.balance(business).await, money("0.00"));
}

#[tokio::test]
async fn test_sweep_leaves_queued_settlements_funded() {
    let t = engine();
    let paid = t.seed_paid_order("15000.00", "95").await;
    let business = Party::business(paid.business_id);
    let queued = t.engine.state.settlements.settle(paid.order.id).await.unwrap();
    assert_eq!(queued.status, SettlementStatus::Pending);

    let nothing_spare = t.engine.state.settlements.sweep(paid.business_id).await;
    assert!(matches!(nothing_spare, Err(ServiceError::Validation(_))));

    t.fund(business, "500.00").await;
    let sweep = t.engine.state.settlements.sweep(paid.business_id).await.unwrap();
    assert_eq!(sweep.net_amount, money("500.00"));

    t.engine.outbox.drain_once(Utc::now()).await.unwrap();
    for id in [queued.id, sweep.id] {
        let settled = t.engine.state.settlements.get(id).await.unwrap();
        assert_eq!(settled.status, SettlementStatus::Success);
    }
    assert_eq!(t.provider.transfer_count(), 2);
    assert_eq!(t.balance(business).await, money("0.00"));
}

#[tokio::test]
async fn test_sweep_of_empty_wallet_is_rejected() {
    let t = engine();
    let paid = t.seed_paid_order("3000.00", "95").await;

    let result = t.engine.state.settlements.sweep(paid.business_id).await;
    assert!(result.is_err());
}
