use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{money, UnknownVariant};

string_enum! {
    pub enum PartyKind as "party type" {
        User => "USER",
        Business => "BUSINESS",
        Platform => "PLATFORM",
    }
}

impl PartyKind {
    /// Parses the lower-case path segment used by the HTTP API.
    pub fn from_path(segment: &str) -> Result<Self, UnknownVariant> {
        PartyKind::from_str(&segment.to_ascii_uppercase())
    }
}

/// Owner of a ledger chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub kind: PartyKind,
    pub id: Uuid,
}

impl Party {
    pub fn user(id: Uuid) -> Self {
        Self { kind: PartyKind::User, id }
    }

    pub fn business(id: Uuid) -> Self {
        Self { kind: PartyKind::Business, id }
    }

    /// The platform's own account. There is exactly one.
    pub fn platform() -> Self {
        Self {
            kind: PartyKind::Platform,
            id: Uuid::nil(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

string_enum! {
    pub enum WalletState as "wallet state" {
        Active => "ACTIVE",
        Frozen => "FROZEN",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: Uuid,
    pub party: Party,
    pub wallet_reference: String,
    pub account_number: Option<String>,
    pub account_name: Option<String>,
    pub bank_name: Option<String>,
    pub bank_code: Option<String>,
    /// Snapshot of the latest `balance_after`, kept in step with every append.
    pub balance: BigDecimal,
    pub state: WalletState,
    #[serde(skip)]
    pub pin_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn provision(party: Party) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            party,
            wallet_reference: format!("WAL-{}", &id.simple().to_string()[..16].to_uppercase()),
            account_number: None,
            account_name: None,
            bank_name: None,
            bank_code: None,
            balance: money::zero(),
            state: WalletState::Active,
            pin_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.state == WalletState::Frozen
    }
}

/// Destination account for withdrawals and payouts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub id: Uuid,
    pub owner: Party,
    pub account_number: String,
    pub account_name: String,
    pub bank_code: String,
    pub bank_name: String,
    pub created_at: DateTime<Utc>,
}

string_enum! {
    pub enum PayoutSchedule as "payout schedule" {
        Immediate => "IMMEDIATE",
        NextDay => "NEXT_DAY",
    }
}

/// Per-business settlement terms, owned by onboarding and read here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutProfile {
    pub business_id: Uuid,
    /// Share of each order kept by the business, 0..=100.
    pub revenue_share_percentage: BigDecimal,
    pub schedule: PayoutSchedule,
    pub bank_account: BankAccount,
    pub subaccount_code: Option<String>,
}
