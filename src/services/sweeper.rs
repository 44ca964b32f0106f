use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::services::payments::PaymentService;
use crate::services::settlement::SettlementService;

/// Periodically expires INITIATED payments that outlived their TTL.
pub async fn run_expiry_sweeper(payments: Arc<PaymentService>, interval: Duration) {
    tracing::info!("Payment expiry sweeper started (every {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = payments.expire_stale(Utc::now()).await {
            tracing::error!("Payment expiry sweep failed: {}", e);
        }
    }
}

/// Periodically re-sends payouts left in PROCESSING without a resolved transfer.
pub async fn run_payout_reconciler(settlements: Arc<SettlementService>, interval: Duration) {
    tracing::info!("Payout reconciler started (every {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match settlements.reconcile_payouts(Utc::now()).await {
            Ok(0) => {}
            Ok(resent) => tracing::info!("Re-sent {} stuck payouts", resent),
            Err(e) => tracing::error!("Payout reconciliation failed: {}", e),
        }
    }
}
