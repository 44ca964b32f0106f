//! Postgres implementation of the storage ports.
//!
//! A unit of work is one SQL transaction. Row locks (`FOR UPDATE`) taken
//! through it are held until commit or drop.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres};
use uuid::Uuid;

use crate::db::models::{
    BankAccountRow, OrderRow, OutboxRow, PayoutProfileRow, SettlementRow, TransactionRow,
    WalletRow, WebhookFailureRow,
};
use crate::domain::{
    BankAccount, Order, OutboxCommand, OutboxMessage, Party, PaymentStatus, PayoutProfile,
    Settlement, SettlementStatus, Transaction, TransactionStatus, Wallet, WebhookFailure,
};
use crate::ports::{
    LedgerRepository, OrderRepository, OutboxRepository, RepositoryError, RepositoryResult,
    SettlementRepository, Store, UnitOfWork, WalletRepository, WebhookDlqRepository,
};

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }
}

pub struct PgUnitOfWork {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn conn(&mut self) -> RepositoryResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(RepositoryError::Closed)
    }
}

fn settlement_data_json(settlement: &Settlement) -> RepositoryResult<serde_json::Value> {
    serde_json::to_value(&settlement.settlement_data)
        .map_err(|e| RepositoryError::Corrupt(format!("settlement_data: {}", e)))
}

#[async_trait]
impl OrderRepository for PgUnitOfWork {
    async fn insert_order(&mut self, order: &Order) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, reference, business_id, buyer_id, buyer_email, subtotal, fees, tax,
                discount, total, status, payment_status, payment_method, delivery_method,
                payment_reference, amount_paid, amount_refunded, initiated_at, paid_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(order.id)
        .bind(&order.reference)
        .bind(order.business_id)
        .bind(order.buyer_id)
        .bind(&order.buyer_email)
        .bind(&order.subtotal)
        .bind(&order.fees)
        .bind(&order.tax)
        .bind(&order.discount)
        .bind(&order.total)
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.payment_method)
        .bind(&order.delivery_method)
        .bind(&order.payment_reference)
        .bind(&order.amount_paid)
        .bind(&order.amount_refunded)
        .bind(order.initiated_at)
        .bind(order.paid_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn find_order(&mut self, id: Uuid) -> RepositoryResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;

        row.map(OrderRow::try_into_domain).transpose()
    }

    async fn lock_order(&mut self, id: Uuid) -> RepositoryResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;

        row.map(OrderRow::try_into_domain).transpose()
    }

    async fn lock_order_by_payment_reference(
        &mut self,
        payment_reference: &str,
    ) -> RepositoryResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE payment_reference = $1 FOR UPDATE",
        )
        .bind(payment_reference)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(OrderRow::try_into_domain).transpose()
    }

    async fn save_order(
        &mut self,
        order: &Order,
        expected: PaymentStatus,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                payment_status = $4,
                payment_method = $5,
                payment_reference = $6,
                amount_paid = $7,
                amount_refunded = $8,
                initiated_at = $9,
                paid_at = $10,
                updated_at = NOW()
            WHERE id = $1 AND payment_status = $2
            "#,
        )
        .bind(order.id)
        .bind(expected.as_str())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.payment_method)
        .bind(&order.payment_reference)
        .bind(&order.amount_paid)
        .bind(&order.amount_refunded)
        .bind(order.initiated_at)
        .bind(order.paid_at)
        .execute(self.conn()?)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn lock_stale_initiated_orders(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT * FROM orders
            WHERE payment_status = 'INITIATED' AND initiated_at < $1
            ORDER BY initiated_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter().map(OrderRow::try_into_domain).collect()
    }
}

#[async_trait]
impl LedgerRepository for PgUnitOfWork {
    async fn find_transaction(&mut self, reference: &str) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(TransactionRow::try_into_domain).transpose()
    }

    async fn lock_transaction(&mut self, reference: &str) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE reference = $1 FOR UPDATE",
        )
        .bind(reference)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(TransactionRow::try_into_domain).transpose()
    }

    async fn last_transaction(&mut self, party: &Party) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE party_type = $1 AND party_id = $2
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(party.kind.as_str())
        .bind(party.id)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(TransactionRow::try_into_domain).transpose()
    }

    async fn insert_transaction(&mut self, entry: &Transaction) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions (
                id, reference, party_type, party_id, user_id, business_id, order_id,
                type, flow, status, amount, fee, net_amount, balance_before, balance_after,
                provider_reference, description, metadata, created_at, updated_at, settled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, $17, $18, $19, $20, $21)
            RETURNING *
            "#,
        )
        .bind(entry.id)
        .bind(&entry.reference)
        .bind(entry.party.kind.as_str())
        .bind(entry.party.id)
        .bind(entry.user_id)
        .bind(entry.business_id)
        .bind(entry.order_id)
        .bind(entry.kind.as_str())
        .bind(entry.flow.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.amount)
        .bind(&entry.fee)
        .bind(&entry.net_amount)
        .bind(&entry.balance_before)
        .bind(&entry.balance_after)
        .bind(&entry.provider_reference)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(entry.settled_at)
        .fetch_one(self.conn()?)
        .await?;

        row.try_into_domain()
    }

    async fn update_transaction_status(
        &mut self,
        reference: &str,
        status: TransactionStatus,
        provider_reference: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2,
                provider_reference = COALESCE($3, provider_reference),
                settled_at = COALESCE($4, settled_at),
                updated_at = NOW()
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .bind(status.as_str())
        .bind(provider_reference)
        .bind(settled_at)
        .execute(self.conn()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("transaction {}", reference)));
        }

        Ok(())
    }

    async fn party_transactions(&mut self, party: &Party) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE party_type = $1 AND party_id = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(party.kind.as_str())
        .bind(party.id)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter().map(TransactionRow::try_into_domain).collect()
    }

    async fn page_party_transactions(
        &mut self,
        party: &Party,
        before_sequence: Option<i64>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE party_type = $1 AND party_id = $2
              AND ($3::BIGINT IS NULL OR sequence < $3)
            ORDER BY sequence DESC
            LIMIT $4
            "#,
        )
        .bind(party.kind.as_str())
        .bind(party.id)
        .bind(before_sequence)
        .bind(limit)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter().map(TransactionRow::try_into_domain).collect()
    }

    async fn order_transactions(&mut self, order_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE order_id = $1 ORDER BY sequence ASC",
        )
        .bind(order_id)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter().map(TransactionRow::try_into_domain).collect()
    }

    async fn pending_debit_total(&mut self, party: &Party) -> RepositoryResult<BigDecimal> {
        let total = sqlx::query_scalar::<_, BigDecimal>(
            r#"
            SELECT COALESCE(SUM(-net_amount), 0) FROM transactions
            WHERE party_type = $1 AND party_id = $2
              AND flow = 'DEBIT' AND status = 'PENDING'
            "#,
        )
        .bind(party.kind.as_str())
        .bind(party.id)
        .fetch_one(self.conn()?)
        .await?;

        Ok(total)
    }
}

#[async_trait]
impl WalletRepository for PgUnitOfWork {
    async fn find_wallet(&mut self, party: &Party) -> RepositoryResult<Option<Wallet>> {
        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT * FROM wallets WHERE party_type = $1 AND party_id = $2",
        )
        .bind(party.kind.as_str())
        .bind(party.id)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(WalletRow::try_into_domain).transpose()
    }

    async fn lock_wallet(&mut self, party: &Party) -> RepositoryResult<Wallet> {
        let fresh = Wallet::provision(*party);
        sqlx::query(
            r#"
            INSERT INTO wallets (id, party_type, party_id, wallet_reference, balance, state,
                                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (party_type, party_id) DO NOTHING
            "#,
        )
        .bind(fresh.id)
        .bind(party.kind.as_str())
        .bind(party.id)
        .bind(&fresh.wallet_reference)
        .bind(&fresh.balance)
        .bind(fresh.state.as_str())
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .execute(self.conn()?)
        .await?;

        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT * FROM wallets WHERE party_type = $1 AND party_id = $2 FOR UPDATE",
        )
        .bind(party.kind.as_str())
        .bind(party.id)
        .fetch_one(self.conn()?)
        .await?;

        row.try_into_domain()
    }

    async fn save_wallet(&mut self, wallet: &Wallet) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE wallets
            SET account_number = $2,
                account_name = $3,
                bank_name = $4,
                bank_code = $5,
                balance = $6,
                state = $7,
                pin_hash = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(wallet.id)
        .bind(&wallet.account_number)
        .bind(&wallet.account_name)
        .bind(&wallet.bank_name)
        .bind(&wallet.bank_code)
        .bind(&wallet.balance)
        .bind(wallet.state.as_str())
        .bind(&wallet.pin_hash)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn insert_bank_account(&mut self, account: &BankAccount) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bank_accounts (id, party_type, party_id, account_number, account_name,
                                       bank_code, bank_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(account.id)
        .bind(account.owner.kind.as_str())
        .bind(account.owner.id)
        .bind(&account.account_number)
        .bind(&account.account_name)
        .bind(&account.bank_code)
        .bind(&account.bank_name)
        .bind(account.created_at)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn find_bank_account(&mut self, id: Uuid) -> RepositoryResult<Option<BankAccount>> {
        let row = sqlx::query_as::<_, BankAccountRow>("SELECT * FROM bank_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;

        row.map(BankAccountRow::try_into_domain).transpose()
    }

    async fn save_payout_profile(&mut self, profile: &PayoutProfile) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO business_payout_profiles (business_id, revenue_share_percentage,
                                                  payout_schedule, bank_account_id,
                                                  subaccount_code, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (business_id) DO UPDATE
            SET revenue_share_percentage = EXCLUDED.revenue_share_percentage,
                payout_schedule = EXCLUDED.payout_schedule,
                bank_account_id = EXCLUDED.bank_account_id,
                subaccount_code = EXCLUDED.subaccount_code,
                updated_at = NOW()
            "#,
        )
        .bind(profile.business_id)
        .bind(&profile.revenue_share_percentage)
        .bind(profile.schedule.as_str())
        .bind(profile.bank_account.id)
        .bind(&profile.subaccount_code)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn find_payout_profile(
        &mut self,
        business_id: Uuid,
    ) -> RepositoryResult<Option<PayoutProfile>> {
        let row = sqlx::query_as::<_, PayoutProfileRow>(
            r#"
            SELECT p.business_id, p.revenue_share_percentage, p.payout_schedule,
                   p.subaccount_code, b.id, b.party_type, b.party_id, b.account_number,
                   b.account_name, b.bank_code, b.bank_name, b.created_at
            FROM business_payout_profiles p
            JOIN bank_accounts b ON b.id = p.bank_account_id
            WHERE p.business_id = $1
            "#,
        )
        .bind(business_id)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(PayoutProfileRow::try_into_domain).transpose()
    }
}

#[async_trait]
impl SettlementRepository for PgUnitOfWork {
    async fn insert_settlement(&mut self, settlement: &Settlement) -> RepositoryResult<()> {
        let data = settlement_data_json(settlement)?;
        sqlx::query(
            r#"
            INSERT INTO settlements (
                id, reference, business_id, order_id, gross_amount, platform_fee, net_amount,
                account_number, account_name, bank_code, status, attempts, transfer_reference,
                settlement_data, scheduled_for, settled_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                      $17, $18)
            "#,
        )
        .bind(settlement.id)
        .bind(&settlement.reference)
        .bind(settlement.business_id)
        .bind(settlement.order_id)
        .bind(&settlement.gross_amount)
        .bind(&settlement.platform_fee)
        .bind(&settlement.net_amount)
        .bind(&settlement.account_number)
        .bind(&settlement.account_name)
        .bind(&settlement.bank_code)
        .bind(settlement.status.as_str())
        .bind(settlement.attempts)
        .bind(&settlement.transfer_reference)
        .bind(data)
        .bind(settlement.scheduled_for)
        .bind(settlement.settled_at)
        .bind(settlement.created_at)
        .bind(settlement.updated_at)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn find_settlement(&mut self, id: Uuid) -> RepositoryResult<Option<Settlement>> {
        let row = sqlx::query_as::<_, SettlementRow>("SELECT * FROM settlements WHERE id = $1")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;

        row.map(SettlementRow::try_into_domain).transpose()
    }

    async fn lock_settlement(&mut self, id: Uuid) -> RepositoryResult<Option<Settlement>> {
        let row = sqlx::query_as::<_, SettlementRow>(
            "SELECT * FROM settlements WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(SettlementRow::try_into_domain).transpose()
    }

    async fn lock_settlement_for_order(
        &mut self,
        order_id: Uuid,
    ) -> RepositoryResult<Option<Settlement>> {
        let row = sqlx::query_as::<_, SettlementRow>(
            "SELECT * FROM settlements WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(SettlementRow::try_into_domain).transpose()
    }

    async fn lock_settlement_by_transfer(
        &mut self,
        transfer_reference: &str,
    ) -> RepositoryResult<Option<Settlement>> {
        let row = sqlx::query_as::<_, SettlementRow>(
            "SELECT * FROM settlements WHERE transfer_reference = $1 FOR UPDATE",
        )
        .bind(transfer_reference)
        .fetch_optional(self.conn()?)
        .await?;

        row.map(SettlementRow::try_into_domain).transpose()
    }

    async fn update_settlement(&mut self, settlement: &Settlement) -> RepositoryResult<()> {
        let data = settlement_data_json(settlement)?;
        sqlx::query(
            r#"
            UPDATE settlements
            SET status = $2,
                attempts = $3,
                transfer_reference = $4,
                settlement_data = $5,
                scheduled_for = $6,
                settled_at = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(settlement.id)
        .bind(settlement.status.as_str())
        .bind(settlement.attempts)
        .bind(&settlement.transfer_reference)
        .bind(data)
        .bind(settlement.scheduled_for)
        .bind(settlement.settled_at)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn list_settlements(
        &mut self,
        business_id: Option<Uuid>,
        status: Option<SettlementStatus>,
        limit: i64,
        offset: i64,
    ) -> RepositoryResult<Vec<Settlement>> {
        let rows = sqlx::query_as::<_, SettlementRow>(
            r#"
            SELECT * FROM settlements
            WHERE ($1::UUID IS NULL OR business_id = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(business_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter().map(SettlementRow::try_into_domain).collect()
    }
}

#[async_trait]
impl OutboxRepository for PgUnitOfWork {
    async fn enqueue(
        &mut self,
        command: OutboxCommand,
        available_at: DateTime<Utc>,
    ) -> RepositoryResult<OutboxMessage> {
        let message = OutboxMessage::new(command, available_at);
        let payload = serde_json::to_value(&message.command)
            .map_err(|e| RepositoryError::Corrupt(format!("outbox command: {}", e)))?;

        let row = sqlx::query_as::<_, OutboxRow>(
            r#"
            INSERT INTO outbox (id, command, attempts, available_at, created_at)
            VALUES ($1, $2, 0, $3, $4)
            RETURNING *
            "#,
        )
        .bind(message.id)
        .bind(payload)
        .bind(message.available_at)
        .bind(message.created_at)
        .fetch_one(self.conn()?)
        .await?;

        row.try_into_domain()
    }

    async fn claim_due(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<OutboxMessage>> {
        // SKIP LOCKED keeps concurrent workers off each other's rows.
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            UPDATE outbox
            SET locked_until = $2, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM outbox
                WHERE processed_at IS NULL
                  AND available_at <= $1
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY available_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter().map(OutboxRow::try_into_domain).collect()
    }

    async fn complete(&mut self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query("UPDATE outbox SET processed_at = NOW(), locked_until = NULL WHERE id = $1")
            .bind(id)
            .execute(self.conn()?)
            .await?;

        Ok(())
    }

    async fn reschedule(
        &mut self,
        id: Uuid,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET available_at = $2, locked_until = NULL, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(available_at)
        .bind(error)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn abandon(&mut self, id: Uuid, error: &str) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET processed_at = NOW(), locked_until = NULL, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl WebhookDlqRepository for PgUnitOfWork {
    async fn record_webhook_failure(&mut self, failure: &WebhookFailure) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_dlq (id, event, reference, payload, error, attempts,
                                     replayed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(failure.id)
        .bind(&failure.event)
        .bind(&failure.reference)
        .bind(&failure.payload)
        .bind(&failure.error)
        .bind(failure.attempts)
        .bind(failure.replayed_at)
        .bind(failure.created_at)
        .bind(failure.updated_at)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }

    async fn find_webhook_failure(&mut self, id: Uuid) -> RepositoryResult<Option<WebhookFailure>> {
        let row = sqlx::query_as::<_, WebhookFailureRow>("SELECT * FROM webhook_dlq WHERE id = $1")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;

        Ok(row.map(WebhookFailure::from))
    }

    async fn list_webhook_failures(
        &mut self,
        include_replayed: bool,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookFailure>> {
        let rows = sqlx::query_as::<_, WebhookFailureRow>(
            r#"
            SELECT * FROM webhook_dlq
            WHERE $1 OR replayed_at IS NULL
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(include_replayed)
        .bind(limit)
        .fetch_all(self.conn()?)
        .await?;

        Ok(rows.into_iter().map(WebhookFailure::from).collect())
    }

    async fn save_webhook_failure(&mut self, failure: &WebhookFailure) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_dlq
            SET error = $2, attempts = $3, replayed_at = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(failure.id)
        .bind(&failure.error)
        .bind(failure.attempts)
        .bind(failure.replayed_at)
        .execute(self.conn()?)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(&mut self) -> RepositoryResult<()> {
        let tx = self.tx.take().ok_or(RepositoryError::Closed)?;
        tx.commit().await?;
        Ok(())
    }
}
