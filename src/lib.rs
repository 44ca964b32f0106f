pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod ports;
pub mod provider;
pub mod services;
pub mod utils;
pub mod validation;

use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::config::EngineSettings;
use crate::ports::Store;
use crate::provider::PaymentProvider;
use crate::services::{
    Ledger, OutboxProcessor, OutboxSignal, PaymentService, SettlementService, TransferResolver,
    WalletService, WebhookProcessor,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<Ledger>,
    pub payments: Arc<PaymentService>,
    pub wallets: Arc<WalletService>,
    pub settlements: Arc<SettlementService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub signature_header: String,
}

/// Every service wired over one store and one provider, plus the outbox
/// worker's half of the wake-up channel.
pub struct Engine {
    pub state: AppState,
    pub outbox: Arc<OutboxProcessor>,
    pub wakeups: mpsc::Receiver<()>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        settings: EngineSettings,
    ) -> Self {
        let (signal, wakeups) = OutboxSignal::channel();
        let ledger = Arc::new(Ledger::new(store.clone()));
        let transfers = Arc::new(TransferResolver::new(
            store.clone(),
            ledger.clone(),
            settings.settlement.clone(),
            signal.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            provider.clone(),
            ledger.clone(),
            settings.clone(),
            signal.clone(),
        ));
        let wallets = Arc::new(WalletService::new(
            store.clone(),
            provider.clone(),
            ledger.clone(),
            transfers.clone(),
            settings.pin_pepper.clone(),
            settings.currency.clone(),
        ));
        let settlements = Arc::new(SettlementService::new(
            store.clone(),
            provider,
            ledger.clone(),
            transfers.clone(),
            settings.settlement.clone(),
            settings.currency.clone(),
            signal,
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            store.clone(),
            settings.webhook_secret.clone(),
            payments.clone(),
            wallets.clone(),
            transfers,
        ));
        let outbox = Arc::new(OutboxProcessor::new(
            store.clone(),
            settlements.clone(),
            settings.settlement.payout_retry_backoff,
        ));

        Self {
            state: AppState {
                store,
                ledger,
                payments,
                wallets,
                settlements,
                webhooks,
                signature_header: settings.signature_header,
            },
            outbox,
            wakeups,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/payment/webhook", post(handlers::webhook::receive))
        .route("/payments/initialize", post(handlers::payments::initialize_payment))
        .route("/payments/verify", post(handlers::payments::verify_payment))
        .route("/orders/:id/refund", post(handlers::payments::refund_order))
        .route("/orders/:id/status", patch(handlers::payments::update_order_status))
        .route("/orders/:id/payment", get(handlers::payments::get_order_payment))
        .route("/orders/:id/settle", post(handlers::settlements::settle_order))
        .route("/settlements", get(handlers::settlements::list_settlements))
        .route("/settlements/:id", get(handlers::settlements::get_settlement))
        .route("/settlements/:id/retry", post(handlers::settlements::retry_settlement))
        .route(
            "/wallets/:party_type/:party_id/balance",
            get(handlers::wallets::get_balance),
        )
        .route(
            "/wallets/:party_type/:party_id/transactions",
            get(handlers::wallets::list_transactions),
        )
        .route(
            "/wallets/:party_type/:party_id/withdrawals",
            post(handlers::wallets::withdraw),
        )
        .route("/transfers/:reference/otp", post(handlers::wallets::submit_transfer_otp))
        .route("/dlq/webhooks", get(handlers::dlq::list_webhook_failures))
        .route("/dlq/webhooks/:id/replay", post(handlers::dlq::replay_webhook_failure))
        .layer(axum::middleware::from_fn(
            middleware::request_logger::request_logger_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
