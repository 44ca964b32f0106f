//! Payment provider gateway.
//!
//! Services talk to the provider only through [`PaymentProvider`]. Every call
//! carries a caller-supplied reference and nothing here retries a
//! non-idempotent operation.

pub mod client;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use client::HttpProvider;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Transport failure, 5xx, open circuit or failed token refresh.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Permanent for the reference it was raised for.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// The outcome of the call is unknown.
    #[error("provider timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Authenticate,
    InitializeCharge,
    VerifyCharge,
    InitiateTransfer,
    ValidateTransferOtp,
    QueryBalance,
    InitiateRefund,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub reference: String,
    pub email: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub callback_url: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeSession {
    pub authorization_url: String,
    pub access_code: Option<String>,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Success,
    Failed,
    Abandoned,
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeVerification {
    pub reference: String,
    pub provider_id: Option<String>,
    pub status: ChargeStatus,
    pub amount: BigDecimal,
    pub paid_at: Option<DateTime<Utc>>,
    pub gateway_response: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub reference: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub account_number: String,
    pub account_name: String,
    pub bank_code: String,
    pub narration: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Pending,
    OtpRequired,
    Failed,
    Reversed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub reference: String,
    pub transfer_code: Option<String>,
    pub status: TransferStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub reference: String,
    pub transaction_reference: String,
    pub amount: BigDecimal,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStatus {
    Processed,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub reference: String,
    pub status: RefundStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderBalance {
    pub currency: String,
    pub balance: BigDecimal,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn supports(&self, capability: Capability) -> bool {
        let _ = capability;
        true
    }

    async fn authenticate(&self) -> ProviderResult<AccessToken>;

    async fn initialize_charge(&self, request: &ChargeRequest) -> ProviderResult<ChargeSession>;

    async fn verify_charge(&self, reference: &str) -> ProviderResult<ChargeVerification>;

    async fn initiate_transfer(&self, request: &TransferRequest) -> ProviderResult<TransferReceipt>;

    async fn validate_transfer_otp(
        &self,
        transfer_code: &str,
        otp: &str,
    ) -> ProviderResult<TransferReceipt>;

    async fn query_balance(&self) -> ProviderResult<Vec<ProviderBalance>>;

    async fn initiate_refund(&self, request: &RefundRequest) -> ProviderResult<RefundReceipt>;
}
