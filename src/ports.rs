//! Storage ports. Services depend on these traits; adapters implement them.
//!
//! Every repository method runs inside a [`UnitOfWork`]: nothing a service
//! writes is visible to anyone else until `commit`, and dropping an
//! uncommitted unit of work discards it.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    BankAccount, Order, OutboxCommand, OutboxMessage, Party, PaymentStatus, PayoutProfile,
    Settlement, SettlementStatus, Transaction, TransactionStatus, Wallet, WebhookFailure,
};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("unit of work already closed")]
    Closed,
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait OrderRepository {
    async fn insert_order(&mut self, order: &Order) -> RepositoryResult<()>;

    async fn find_order(&mut self, id: Uuid) -> RepositoryResult<Option<Order>>;

    /// Reads the order and holds its row lock until the unit of work ends.
    async fn lock_order(&mut self, id: Uuid) -> RepositoryResult<Option<Order>>;

    async fn lock_order_by_payment_reference(
        &mut self,
        payment_reference: &str,
    ) -> RepositoryResult<Option<Order>>;

    /// Writes every mutable field of `order` if its stored payment status is
    /// still `expected`. Returns false when the compare-and-set lost.
    async fn save_order(
        &mut self,
        order: &Order,
        expected: PaymentStatus,
    ) -> RepositoryResult<bool>;

    /// Locks up to `limit` INITIATED orders started before `cutoff`, skipping
    /// rows other workers hold.
    async fn lock_stale_initiated_orders(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Order>>;
}

#[async_trait]
pub trait LedgerRepository {
    async fn find_transaction(&mut self, reference: &str) -> RepositoryResult<Option<Transaction>>;

    async fn lock_transaction(&mut self, reference: &str) -> RepositoryResult<Option<Transaction>>;

    /// Most recent entry in the party's chain.
    async fn last_transaction(&mut self, party: &Party) -> RepositoryResult<Option<Transaction>>;

    /// Inserts the entry and returns it with its assigned sequence.
    async fn insert_transaction(&mut self, entry: &Transaction) -> RepositoryResult<Transaction>;

    async fn update_transaction_status(
        &mut self,
        reference: &str,
        status: TransactionStatus,
        provider_reference: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()>;

    /// Whole chain, oldest first.
    async fn party_transactions(&mut self, party: &Party) -> RepositoryResult<Vec<Transaction>>;

    /// Newest first, strictly before `before_sequence` when given.
    async fn page_party_transactions(
        &mut self,
        party: &Party,
        before_sequence: Option<i64>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>>;

    async fn order_transactions(&mut self, order_id: Uuid) -> RepositoryResult<Vec<Transaction>>;

    /// Sum of the absolute net amounts of PENDING debits for the party.
    async fn pending_debit_total(&mut self, party: &Party) -> RepositoryResult<BigDecimal>;
}

#[async_trait]
pub trait WalletRepository {
    async fn find_wallet(&mut self, party: &Party) -> RepositoryResult<Option<Wallet>>;

    /// Locks the party's wallet row, provisioning an empty wallet on first use.
    async fn lock_wallet(&mut self, party: &Party) -> RepositoryResult<Wallet>;

    async fn save_wallet(&mut self, wallet: &Wallet) -> RepositoryResult<()>;

    async fn insert_bank_account(&mut self, account: &BankAccount) -> RepositoryResult<()>;

    async fn find_bank_account(&mut self, id: Uuid) -> RepositoryResult<Option<BankAccount>>;

    async fn save_payout_profile(&mut self, profile: &PayoutProfile) -> RepositoryResult<()>;

    async fn find_payout_profile(&mut self, business_id: Uuid)
        -> RepositoryResult<Option<PayoutProfile>>;
}

#[async_trait]
pub trait SettlementRepository {
    async fn insert_settlement(&mut self, settlement: &Settlement) -> RepositoryResult<()>;

    async fn find_settlement(&mut self, id: Uuid) -> RepositoryResult<Option<Settlement>>;

    async fn lock_settlement(&mut self, id: Uuid) -> RepositoryResult<Option<Settlement>>;

    async fn lock_settlement_for_order(&mut self, order_id: Uuid)
        -> RepositoryResult<Option<Settlement>>;

    async fn lock_settlement_by_transfer(
        &mut self,
        transfer_reference: &str,
    ) -> RepositoryResult<Option<Settlement>>;

    async fn update_settlement(&mut self, settlement: &Settlement) -> RepositoryResult<()>;

    async fn list_settlements(
        &mut self,
        business_id: Option<Uuid>,
        status: Option<SettlementStatus>,
        limit: i64,
        offset: i64,
    ) -> RepositoryResult<Vec<Settlement>>;
}

#[async_trait]
pub trait OutboxRepository {
    async fn enqueue(
        &mut self,
        command: OutboxCommand,
        available_at: DateTime<Utc>,
    ) -> RepositoryResult<OutboxMessage>;

    /// Leases up to `limit` due messages until `lease_until`.
    async fn claim_due(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<OutboxMessage>>;

    async fn complete(&mut self, id: Uuid) -> RepositoryResult<()>;

    /// Releases the lease and makes the message due again at `available_at`.
    async fn reschedule(
        &mut self,
        id: Uuid,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()>;

    /// Gives up on the message, keeping its last error.
    async fn abandon(&mut self, id: Uuid, error: &str) -> RepositoryResult<()>;
}

#[async_trait]
pub trait WebhookDlqRepository {
    async fn record_webhook_failure(&mut self, failure: &WebhookFailure) -> RepositoryResult<()>;

    async fn find_webhook_failure(&mut self, id: Uuid) -> RepositoryResult<Option<WebhookFailure>>;

    async fn list_webhook_failures(
        &mut self,
        include_replayed: bool,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookFailure>>;

    async fn save_webhook_failure(&mut self, failure: &WebhookFailure) -> RepositoryResult<()>;
}

/// One atomic unit of work over every repository.
#[async_trait]
pub trait UnitOfWork:
    OrderRepository
    + LedgerRepository
    + WalletRepository
    + SettlementRepository
    + OutboxRepository
    + WebhookDlqRepository
    + Send
{
    async fn commit(&mut self) -> RepositoryResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>>;
}
