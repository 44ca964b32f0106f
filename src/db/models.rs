//! Row types for SQLx. Converted into domain entities before leaving the adapter.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::settlement::SettlementData;
use crate::domain::{
    BankAccount, Flow, Order, OrderStatus, OutboxCommand, OutboxMessage, Party, PartyKind,
    PaymentStatus, PayoutProfile, PayoutSchedule, Settlement, SettlementStatus, Transaction,
    TransactionStatus, TransactionType, UnknownVariant, Wallet, WalletState, WebhookFailure,
};
use crate::ports::RepositoryError;

impl From<UnknownVariant> for RepositoryError {
    fn from(err: UnknownVariant) -> Self {
        RepositoryError::Corrupt(err.to_string())
    }
}

fn party(kind: &str, id: Uuid) -> Result<Party, RepositoryError> {
    Ok(Party {
        kind: PartyKind::from_str(kind)?,
        id,
    })
}

#[derive(Debug, FromRow)]
pub struct OrderRow {
    pub id: Uuid,
    pub reference: String,
    pub business_id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub buyer_email: String,
    pub subtotal: BigDecimal,
    pub fees: BigDecimal,
    pub tax: BigDecimal,
    pub discount: BigDecimal,
    pub total: BigDecimal,
    pub status: String,
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub delivery_method: Option<String>,
    pub payment_reference: Option<String>,
    pub amount_paid: BigDecimal,
    pub amount_refunded: BigDecimal,
    pub initiated_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn try_into_domain(self) -> Result<Order, RepositoryError> {
        Ok(Order {
            id: self.id,
            reference: self.reference,
            business_id: self.business_id,
            buyer_id: self.buyer_id,
            buyer_email: self.buyer_email,
            subtotal: self.subtotal,
            fees: self.fees,
            tax: self.tax,
            discount: self.discount,
            total: self.total,
            status: OrderStatus::from_str(&self.status)?,
            payment_status: PaymentStatus::from_str(&self.payment_status)?,
            payment_method: self.payment_method,
            delivery_method: self.delivery_method,
            payment_reference: self.payment_reference,
            amount_paid: self.amount_paid,
            amount_refunded: self.amount_refunded,
            initiated_at: self.initiated_at,
            paid_at: self.paid_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub sequence: i64,
    pub reference: String,
    pub party_type: String,
    pub party_id: Uuid,
    pub user_id: Option<Uuid>,
    pub business_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub flow: String,
    pub status: String,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub net_amount: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub provider_reference: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    pub fn try_into_domain(self) -> Result<Transaction, RepositoryError> {
        Ok(Transaction {
            id: self.id,
            sequence: self.sequence,
            reference: self.reference,
            party: party(&self.party_type, self.party_id)?,
            user_id: self.user_id,
            business_id: self.business_id,
            order_id: self.order_id,
            kind: TransactionType::from_str(&self.kind)?,
            flow: Flow::from_str(&self.flow)?,
            status: TransactionStatus::from_str(&self.status)?,
            amount: self.amount,
            fee: self.fee,
            net_amount: self.net_amount,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            provider_reference: self.provider_reference,
            description: self.description,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
            settled_at: self.settled_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct WalletRow {
    pub id: Uuid,
    pub party_type: String,
    pub party_id: Uuid,
    pub wallet_reference: String,
    pub account_number: Option<String>,
    pub account_name: Option<String>,
    pub bank_name: Option<String>,
    pub bank_code: Option<String>,
    pub balance: BigDecimal,
    pub state: String,
    pub pin_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletRow {
    pub fn try_into_domain(self) -> Result<Wallet, RepositoryError> {
        Ok(Wallet {
            id: self.id,
            party: party(&self.party_type, self.party_id)?,
            wallet_reference: self.wallet_reference,
            account_number: self.account_number,
            account_name: self.account_name,
            bank_name: self.bank_name,
            bank_code: self.bank_code,
            balance: self.balance,
            state: WalletState::from_str(&self.state)?,
            pin_hash: self.pin_hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct BankAccountRow {
    pub id: Uuid,
    pub party_type: String,
    pub party_id: Uuid,
    pub account_number: String,
    pub account_name: String,
    pub bank_code: String,
    pub bank_name: String,
    pub created_at: DateTime<Utc>,
}

impl BankAccountRow {
    pub fn try_into_domain(self) -> Result<BankAccount, RepositoryError> {
        Ok(BankAccount {
            id: self.id,
            owner: party(&self.party_type, self.party_id)?,
            account_number: self.account_number,
            account_name: self.account_name,
            bank_code: self.bank_code,
            bank_name: self.bank_name,
            created_at: self.created_at,
        })
    }
}

/// Payout profile joined with its destination account.
#[derive(Debug, FromRow)]
pub struct PayoutProfileRow {
    pub business_id: Uuid,
    pub revenue_share_percentage: BigDecimal,
    pub payout_schedule: String,
    pub subaccount_code: Option<String>,
    #[sqlx(flatten)]
    pub bank_account: BankAccountRow,
}

impl PayoutProfileRow {
    pub fn try_into_domain(self) -> Result<PayoutProfile, RepositoryError> {
        Ok(PayoutProfile {
            business_id: self.business_id,
            revenue_share_percentage: self.revenue_share_percentage,
            schedule: PayoutSchedule::from_str(&self.payout_schedule)?,
            bank_account: self.bank_account.try_into_domain()?,
            subaccount_code: self.subaccount_code,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct SettlementRow {
    pub id: Uuid,
    pub reference: String,
    pub business_id: Uuid,
    pub order_id: Option<Uuid>,
    pub gross_amount: BigDecimal,
    pub platform_fee: BigDecimal,
    pub net_amount: BigDecimal,
    pub account_number: String,
    pub account_name: String,
    pub bank_code: String,
    pub status: String,
    pub attempts: i32,
    pub transfer_reference: Option<String>,
    pub settlement_data: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRow {
    pub fn try_into_domain(self) -> Result<Settlement, RepositoryError> {
        let settlement_data: SettlementData = serde_json::from_value(self.settlement_data)
            .map_err(|e| RepositoryError::Corrupt(format!("settlement_data: {}", e)))?;

        Ok(Settlement {
            id: self.id,
            reference: self.reference,
            business_id: self.business_id,
            order_id: self.order_id,
            gross_amount: self.gross_amount,
            platform_fee: self.platform_fee,
            net_amount: self.net_amount,
            account_number: self.account_number,
            account_name: self.account_name,
            bank_code: self.bank_code,
            status: SettlementStatus::from_str(&self.status)?,
            attempts: self.attempts,
            transfer_reference: self.transfer_reference,
            settlement_data,
            scheduled_for: self.scheduled_for,
            settled_at: self.settled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct OutboxRow {
    pub id: Uuid,
    pub command: serde_json::Value,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRow {
    pub fn try_into_domain(self) -> Result<OutboxMessage, RepositoryError> {
        let command: OutboxCommand = serde_json::from_value(self.command)
            .map_err(|e| RepositoryError::Corrupt(format!("outbox command: {}", e)))?;

        Ok(OutboxMessage {
            id: self.id,
            command,
            attempts: self.attempts,
            available_at: self.available_at,
            locked_until: self.locked_until,
            last_error: self.last_error,
            processed_at: self.processed_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct WebhookFailureRow {
    pub id: Uuid,
    pub event: String,
    pub reference: Option<String>,
    pub payload: String,
    pub error: String,
    pub attempts: i32,
    pub replayed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WebhookFailureRow> for WebhookFailure {
    fn from(row: WebhookFailureRow) -> Self {
        WebhookFailure {
            id: row.id,
            event: row.event,
            reference: row.reference,
            payload: row.payload,
            error: row.error,
            attempts: row.attempts,
            replayed_at: row.replayed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
