use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{money, BankAccount};

string_enum! {
    pub enum SettlementStatus as "settlement status" {
        Pending => "PENDING",
        Processing => "PROCESSING",
        Success => "SUCCESS",
        Failed => "FAILED",
    }
}

string_enum! {
    /// How merchant funds reach the merchant.
    pub enum SettlementMode as "settlement mode" {
        /// Funds land in the platform balance and are paid out by transfer.
        MainBalance => "main_balance",
        /// The provider splits each charge into a merchant subaccount.
        Subaccount => "subaccount",
    }
}

/// Fee split for one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementSplit {
    pub gross: BigDecimal,
    pub platform_fee: BigDecimal,
    pub net: BigDecimal,
}

impl SettlementSplit {
    /// `platform_fee = total * (100 - share) / 100`, rounded half-up to minor units.
    pub fn compute(total: &BigDecimal, revenue_share_percentage: &BigDecimal) -> Self {
        let hundred = BigDecimal::from(100);
        let kept_by_platform = hundred.clone() - revenue_share_percentage.clone();
        let platform_fee = money::round_minor(&((total.clone() * kept_by_platform) / hundred));
        let net = total - &platform_fee;
        Self {
            gross: total.clone(),
            platform_fee,
            net,
        }
    }
}

/// Free-form settlement details kept as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SettlementData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SettlementMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subaccount_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
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
    pub status: SettlementStatus,
    pub attempts: i32,
    pub transfer_reference: Option<String>,
    pub settlement_data: SettlementData,
    pub scheduled_for: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    pub fn new(
        reference: String,
        business_id: Uuid,
        order_id: Option<Uuid>,
        split: SettlementSplit,
        destination: &BankAccount,
        mode: SettlementMode,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference,
            business_id,
            order_id,
            gross_amount: split.gross,
            platform_fee: split.platform_fee,
            net_amount: split.net,
            account_number: destination.account_number.clone(),
            account_name: destination.account_name.clone(),
            bank_code: destination.bank_code.clone(),
            status: SettlementStatus::Pending,
            attempts: 0,
            transfer_reference: None,
            settlement_data: SettlementData {
                mode: Some(mode),
                ..Default::default()
            },
            scheduled_for,
            settled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mode(&self) -> SettlementMode {
        self.settlement_data.mode.unwrap_or(SettlementMode::MainBalance)
    }

    /// Transfer reference for the next payout attempt.
    pub fn next_transfer_reference(&self) -> String {
        format!("{}-{}", self.reference, self.attempts + 1)
    }
}
