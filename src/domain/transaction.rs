//! Ledger entry entity.
//! Entries are append-only; only `status` (and a pending transfer code) may change.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{money, Party};

string_enum! {
    pub enum TransactionType as "transaction type" {
        OrderPayment => "ORDER_PAYMENT",
        Settlement => "SETTLEMENT",
        Withdrawal => "WITHDRAWAL",
        Refund => "REFUND",
        WalletFunding => "WALLET_FUNDING",
        Payout => "PAYOUT",
        Fee => "FEE",
        Reversal => "REVERSAL",
    }
}

impl TransactionType {
    /// Types whose debits may never take a balance below zero.
    pub fn forbids_overdraft(self) -> bool {
        matches!(
            self,
            TransactionType::Withdrawal | TransactionType::Payout | TransactionType::Refund
        )
    }

    /// Debits that leave the system through a provider transfer.
    pub fn is_transfer(self) -> bool {
        matches!(self, TransactionType::Withdrawal | TransactionType::Payout)
    }
}

string_enum! {
    pub enum Flow as "flow" {
        Credit => "CREDIT",
        Debit => "DEBIT",
    }
}

string_enum! {
    pub enum TransactionStatus as "transaction status" {
        Pending => "PENDING",
        Success => "SUCCESS",
        Failed => "FAILED",
        Reversed => "REVERSED",
    }
}

impl TransactionStatus {
    pub fn can_resolve_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Success | Failed | Reversed) | (Success, Reversed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub sequence: i64,
    pub reference: String,
    pub party: Party,
    pub user_id: Option<Uuid>,
    pub business_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub flow: Flow,
    pub status: TransactionStatus,
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

impl Transaction {
    /// Reference of the compensating credit for a failed or reversed debit.
    pub fn reversal_reference(&self) -> String {
        format!("{}-REV", self.reference)
    }
}

/// Input to the ledger append. Balances are computed by the ledger, never supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTransaction {
    pub party: Party,
    pub kind: TransactionType,
    pub flow: Flow,
    pub amount: BigDecimal,
    pub fee: BigDecimal,
    pub reference: String,
    pub status: TransactionStatus,
    pub user_id: Option<Uuid>,
    pub business_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub provider_reference: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

impl ProposedTransaction {
    pub fn new(
        party: Party,
        kind: TransactionType,
        flow: Flow,
        amount: BigDecimal,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            party,
            kind,
            flow,
            amount,
            fee: money::zero(),
            reference: reference.into(),
            status: TransactionStatus::Success,
            user_id: None,
            business_id: None,
            order_id: None,
            provider_reference: None,
            description: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn credit(party: Party, kind: TransactionType, amount: BigDecimal, reference: impl Into<String>) -> Self {
        Self::new(party, kind, Flow::Credit, amount, reference)
    }

    pub fn debit(party: Party, kind: TransactionType, amount: BigDecimal, reference: impl Into<String>) -> Self {
        Self::new(party, kind, Flow::Debit, amount, reference)
    }

    pub fn with_fee(mut self, fee: BigDecimal) -> Self {
        self.fee = fee;
        self
    }

    pub fn pending(mut self) -> Self {
        self.status = TransactionStatus::Pending;
        self
    }

    pub fn for_order(mut self, order_id: Uuid) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn for_business(mut self, business_id: Uuid) -> Self {
        self.business_id = Some(business_id);
        self
    }

    pub fn for_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_provider_reference(mut self, reference: impl Into<String>) -> Self {
        self.provider_reference = Some(reference.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Signed effect on the party's balance.
    pub fn net_amount(&self) -> BigDecimal {
        let net = &self.amount - &self.fee;
        match self.flow {
            Flow::Credit => net,
            Flow::Debit => -net,
        }
    }
}
