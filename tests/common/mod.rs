#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use settlement_core::adapters::MemoryStore;
use settlement_core::config::{EngineSettings, SettlementConfig};
use settlement_core::domain::{
    BankAccount, Order, Party, PayoutProfile, PayoutSchedule, ProposedTransaction, SettlementMode,
    Transaction, TransactionType,
};
use settlement_core::ports::{LedgerRepository, OrderRepository, Store, WalletRepository};
use settlement_core::provider::{
    AccessToken, ChargeRequest, ChargeSession, ChargeVerification, PaymentProvider,
    ProviderBalance, ProviderError, ProviderResult, RefundReceipt, RefundRequest, RefundStatus,
    TransferReceipt, TransferRequest, TransferStatus,
};
use settlement_core::services::payments::{ChargeCapture, InitializePayment};
use settlement_core::services::webhook::signature;
use settlement_core::Engine;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";
pub const PIN: &str = "2468";

pub fn money(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

/// Provider fake. Each call pops the next scripted result, falling back to success.
#[derive(Default)]
pub struct ScriptedProvider {
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub verifications: Mutex<VecDeque<ProviderResult<ChargeVerification>>>,
    pub transfer_results: Mutex<VecDeque<ProviderResult<TransferReceipt>>>,
    pub transfers: Mutex<Vec<TransferRequest>>,
    pub otp_results: Mutex<VecDeque<ProviderResult<TransferReceipt>>>,
    pub refund_results: Mutex<VecDeque<ProviderResult<RefundReceipt>>>,
    pub refunds: Mutex<Vec<RefundRequest>>,
    pub balance: Mutex<Option<BigDecimal>>,
}

impl ScriptedProvider {
    pub fn script_transfer(&self, result: ProviderResult<TransferReceipt>) {
        self.transfer_results.lock().unwrap().push_back(result);
    }

    pub fn script_transfer_status(&self, status: TransferStatus) {
        self.script_transfer(Ok(TransferReceipt {
            reference: String::new(),
            transfer_code: Some(format!("TRF_{}", Uuid::new_v4().simple())),
            status,
            message: None,
        }));
    }

    pub fn script_verification(&self, result: ProviderResult<ChargeVerification>) {
        self.verifications.lock().unwrap().push_back(result);
    }

    pub fn script_refund(&self, result: ProviderResult<RefundReceipt>) {
        self.refund_results.lock().unwrap().push_back(result);
    }

    pub fn script_otp(&self, result: ProviderResult<TransferReceipt>) {
        self.otp_results.lock().unwrap().push_back(result);
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    pub fn last_transfer(&self) -> Option<TransferRequest> {
        self.transfers.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    async fn authenticate(&self) -> ProviderResult<AccessToken> {
        Ok(AccessToken {
            token: "test-token".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }

    async fn initialize_charge(&self, request: &ChargeRequest) -> ProviderResult<ChargeSession> {
        self.charges.lock().unwrap().push(request.clone());
        Ok(ChargeSession {
            authorization_url: format!("https://checkout.test/{}", request.reference),
            access_code: Some("ac_test".to_string()),
            reference: request.reference.clone(),
        })
    }

    async fn verify_charge(&self, reference: &str) -> ProviderResult<ChargeVerification> {
        match self.verifications.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Err(ProviderError::Rejected(format!("no charge scripted for {}", reference))),
        }
    }

    async fn initiate_transfer(&self, request: &TransferRequest) -> ProviderResult<TransferReceipt> {
        self.transfers.lock().unwrap().push(request.clone());
        let scripted = self.transfer_results.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(mut receipt)) => {
                receipt.reference = request.reference.clone();
                Ok(receipt)
            }
            Some(Err(e)) => Err(e),
            None => Ok(TransferReceipt {
                reference: request.reference.clone(),
                transfer_code: Some(format!("TRF_{}", request.reference)),
                status: TransferStatus::Success,
                message: None,
            }),
        }
    }

    async fn validate_transfer_otp(
        &self,
        transfer_code: &str,
        _otp: &str,
    ) -> ProviderResult<TransferReceipt> {
        match self.otp_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(TransferReceipt {
                reference: String::new(),
                transfer_code: Some(transfer_code.to_string()),
                status: TransferStatus::Success,
                message: None,
            }),
        }
    }

    async fn query_balance(&self) -> ProviderResult<Vec<ProviderBalance>> {
        Ok(self
            .balance
            .lock()
            .unwrap()
            .clone()
            .map(|balance| {
                vec![ProviderBalance {
                    currency: "NGN".to_string(),
                    balance,
                }]
            })
            .unwrap_or_default())
    }

    async fn initiate_refund(&self, request: &RefundRequest) -> ProviderResult<RefundReceipt> {
        self.refunds.lock().unwrap().push(request.clone());
        match self.refund_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(RefundReceipt {
                reference: request.reference.clone(),
                status: RefundStatus::Processed,
            }),
        }
    }
}

pub fn settlement_config(mode: SettlementMode) -> SettlementConfig {
    SettlementConfig {
        mode,
        auto_settle: false,
        batch_schedule: cron::Schedule::from_str("0 0 9 * * *").unwrap(),
        payout_max_attempts: 3,
        payout_retry_backoff: Duration::from_secs(60),
        payout_reconcile_after: Duration::from_secs(600),
    }
}

pub fn settings(mode: SettlementMode) -> EngineSettings {
    EngineSettings {
        currency: "NGN".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        signature_header: SIGNATURE_HEADER.to_string(),
        payment_ttl: ChronoDuration::minutes(30),
        pin_pepper: "test-pepper".to_string(),
        settlement: settlement_config(mode),
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
}

pub fn engine() -> TestEngine {
    engine_with(settings(SettlementMode::MainBalance))
}

pub fn engine_with(settings: EngineSettings) -> TestEngine {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::default());
    let engine = Engine::new(store.clone(), provider.clone(), settings);
    TestEngine {
        engine,
        store,
        provider,
    }
}

/// A paid order and everything needed to settle it.
pub struct PaidOrder {
    pub order: Order,
    pub payment_reference: String,
    pub business_id: Uuid,
    pub buyer_id: Uuid,
    pub bank_account: BankAccount,
}

pub fn bank_account(owner: Party) -> BankAccount {
    BankAccount {
        id: Uuid::new_v4(),
        owner,
        account_number: "0123456789".to_string(),
        account_name: "Ada Stores Ltd".to_string(),
        bank_code: "058".to_string(),
        bank_name: "GTBank".to_string(),
        created_at: Utc::now(),
    }
}

impl TestEngine {
    pub async fn seed_order(&self, total: &str, share: &str) -> (Order, BankAccount) {
        let business_id = Uuid::new_v4();
        let mut order = Order::new(business_id, "buyer@example.com", money(total));
        order.buyer_id = Some(Uuid::new_v4());
        let account = bank_account(Party::business(business_id));

        let mut uow = self.store.begin().await.unwrap();
        uow.insert_order(&order).await.unwrap();
        uow.insert_bank_account(&account).await.unwrap();
        uow.save_payout_profile(&PayoutProfile {
            business_id,
            revenue_share_percentage: money(share),
            schedule: PayoutSchedule::Immediate,
            bank_account: account.clone(),
            subaccount_code: Some("ACCT_sub_test".to_string()),
        })
        .await
        .unwrap();
        uow.commit().await.unwrap();

        (order, account)
    }

    /// Seeds an order, opens a payment for it and captures it in full.
    pub async fn seed_paid_order(&self, total: &str, share: &str) -> PaidOrder {
        let (order, bank_account) = self.seed_order(total, share).await;
        let session = self
            .engine
            .state
            .payments
            .initialize(order.id, InitializePayment::default())
            .await
            .unwrap();
        self.engine
            .state
            .payments
            .apply_charge_success(&ChargeCapture {
                payment_reference: session.payment_reference.clone(),
                provider_id: Some("900001".to_string()),
                amount: money(total),
                paid_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        let order = self.order(order.id).await;
        PaidOrder {
            business_id: order.business_id,
            buyer_id: order.buyer_id.unwrap(),
            order,
            payment_reference: session.payment_reference,
            bank_account,
        }
    }

    pub async fn order(&self, id: Uuid) -> Order {
        let mut uow = self.store.begin().await.unwrap();
        uow.find_order(id).await.unwrap().unwrap()
    }

    pub async fn entry(&self, reference: &str) -> Option<Transaction> {
        let mut uow = self.store.begin().await.unwrap();
        uow.find_transaction(reference).await.unwrap()
    }

    pub async fn entries(&self, party: Party) -> Vec<Transaction> {
        let mut uow = self.store.begin().await.unwrap();
        uow.party_transactions(&party).await.unwrap()
    }

    pub async fn balance(&self, party: Party) -> BigDecimal {
        let mut uow = self.store.begin().await.unwrap();
        uow.find_wallet(&party)
            .await
            .unwrap()
            .map(|w| w.balance)
            .unwrap_or_default()
    }

    /// Credits a wallet directly through the ledger.
    pub async fn fund(&self, party: Party, amount: &str) -> Transaction {
        let mut uow = self.store.begin().await.unwrap();
        let entry = ProposedTransaction::credit(
            party,
            TransactionType::WalletFunding,
            money(amount),
            format!("FND-{}", Uuid::new_v4().simple()),
        );
        let appended = self
            .engine
            .state
            .ledger
            .append(uow.as_mut(), entry)
            .await
            .unwrap();
        uow.commit().await.unwrap();
        appended.into_transaction()
    }

    pub async fn set_pin(&self, party: Party) {
        self.engine.state.wallets.set_pin(party, PIN).await.unwrap();
    }

    /// A bank account owned by `party`, ready for withdrawals.
    pub async fn seed_bank_account(&self, party: Party) -> BankAccount {
        let account = bank_account(party);
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_bank_account(&account).await.unwrap();
        uow.commit().await.unwrap();
        account
    }
}

pub fn sign(body: &[u8]) -> String {
    signature::sign(WEBHOOK_SECRET, body).unwrap()
}
