//! Wallet balances, PINs, funding and withdrawals.

use arc_swap::ArcSwapOption;
use bigdecimal::BigDecimal;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::domain::{
    Party, PartyKind, ProposedTransaction, Transaction, TransactionStatus, TransactionType, Wallet,
    WalletState,
};
use crate::ports::{LedgerRepository, Store, WalletRepository};
use crate::provider::{Capability, PaymentProvider, TransferRequest};
use crate::services::ledger::{Appended, Ledger, LedgerError};
use crate::services::payments::ChargeCapture;
use crate::services::transfers::{TransferOutcome, TransferResolver};
use crate::services::{Disposition, ServiceError, ServiceResult};
use crate::utils::cursor;
use crate::validation::{self, ValidationError};

type HmacSha256 = Hmac<Sha256>;

const PROVIDER_BALANCE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub party: Party,
    pub wallet_reference: String,
    pub account_number: Option<String>,
    pub account_name: Option<String>,
    pub bank_name: Option<String>,
    pub bank_code: Option<String>,
    pub available_balance: BigDecimal,
    pub ledger_balance: BigDecimal,
    pub state: WalletState,
    pub currency: String,
    /// Reported by the provider; informational only, never used to authorize a debit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_reported_balance: Option<BigDecimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub items: Vec<Transaction>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub amount: BigDecimal,
    pub bank_account_id: Uuid,
    pub pin: String,
    pub narration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub success: bool,
    pub reference: String,
    pub status: TransactionStatus,
    pub otp_required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    pub account_number: Option<String>,
    pub account_name: Option<String>,
    pub bank_name: Option<String>,
    pub bank_code: Option<String>,
}

struct CachedBalance {
    balance: Option<BigDecimal>,
    fetched_at: Instant,
}

pub struct WalletService {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    ledger: Arc<Ledger>,
    transfers: Arc<TransferResolver>,
    pin_pepper: String,
    currency: String,
    provider_balance: ArcSwapOption<CachedBalance>,
}

impl WalletService {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        ledger: Arc<Ledger>,
        transfers: Arc<TransferResolver>,
        pin_pepper: String,
        currency: String,
    ) -> Self {
        Self {
            store,
            provider,
            ledger,
            transfers,
            pin_pepper,
            currency,
            provider_balance: ArcSwapOption::empty(),
        }
    }

    fn hash_pin(&self, party: &Party, pin: &str) -> Result<HmacSha256, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(self.pin_pepper.as_bytes())
            .map_err(|_| ValidationError::new("pin", "PIN hashing is not configured"))?;
        mac.update(format!("{}:{}", party, pin).as_bytes());
        Ok(mac)
    }

    fn pin_matches(&self, wallet: &Wallet, pin: &str) -> Result<bool, ServiceError> {
        let Some(stored) = &wallet.pin_hash else {
            return Ok(false);
        };
        let Ok(expected) = hex::decode(stored) else {
            return Ok(false);
        };
        Ok(self.hash_pin(&wallet.party, pin)?.verify_slice(&expected).is_ok())
    }

    /// Provisions the wallet if needed and records its external account details.
    pub async fn provision(&self, party: Party, details: AccountDetails) -> ServiceResult<Wallet> {
        let mut uow = self.store.begin().await?;
        let mut wallet = uow.lock_wallet(&party).await?;
        let clean = |value: Option<String>| {
            value
                .map(|v| validation::sanitize_string(&v))
                .filter(|v| !v.is_empty())
        };
        wallet.account_number = clean(details.account_number).or(wallet.account_number);
        wallet.account_name = clean(details.account_name).or(wallet.account_name);
        wallet.bank_name = clean(details.bank_name).or(wallet.bank_name);
        wallet.bank_code = clean(details.bank_code).or(wallet.bank_code);
        uow.save_wallet(&wallet).await?;
        uow.commit().await?;
        Ok(wallet)
    }

    pub async fn set_pin(&self, party: Party, pin: &str) -> ServiceResult<()> {
        validation::validate_pin(pin)?;
        let hash = hex::encode(self.hash_pin(&party, pin)?.finalize().into_bytes());

        let mut uow = self.store.begin().await?;
        let mut wallet = uow.lock_wallet(&party).await?;
        wallet.pin_hash = Some(hash);
        uow.save_wallet(&wallet).await?;
        uow.commit().await?;

        tracing::info!("PIN updated for wallet {}", wallet.wallet_reference);
        Ok(())
    }

    pub async fn balance(&self, party: Party) -> ServiceResult<WalletBalance> {
        let (wallet, pending_debits) = {
            let mut uow = self.store.begin().await?;
            let wallet = uow
                .find_wallet(&party)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("wallet for {}", party)))?;
            let pending = uow.pending_debit_total(&party).await?;
            (wallet, pending)
        };

        let provider_reported_balance = if party.kind == PartyKind::Platform {
            self.provider_reported_balance().await
        } else {
            None
        };

        Ok(WalletBalance {
            party,
            wallet_reference: wallet.wallet_reference,
            account_number: wallet.account_number,
            account_name: wallet.account_name,
            bank_name: wallet.bank_name,
            bank_code: wallet.bank_code,
            ledger_balance: &wallet.balance + &pending_debits,
            available_balance: wallet.balance,
            state: wallet.state,
            currency: self.currency.clone(),
            provider_reported_balance,
        })
    }

    async fn provider_reported_balance(&self) -> Option<BigDecimal> {
        if let Some(cached) = self.provider_balance.load_full() {
            if cached.fetched_at.elapsed() < PROVIDER_BALANCE_TTL {
                return cached.balance.clone();
            }
        }

        let balance = match self.provider.query_balance().await {
            Ok(balances) => balances
                .into_iter()
                .find(|b| b.currency.eq_ignore_ascii_case(&self.currency))
                .map(|b| b.balance),
            Err(e) => {
                tracing::warn!("Provider balance unavailable: {}", e);
                return None;
            }
        };

        self.provider_balance.store(Some(Arc::new(CachedBalance {
            balance: balance.clone(),
            fetched_at: Instant::now(),
        })));
        balance
    }

    /// Newest first. The cursor is the last item of the previous page.
    pub async fn transactions(
        &self,
        party: Party,
        cursor_token: Option<&str>,
        limit: Option<i64>,
    ) -> ServiceResult<TransactionPage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let before = match cursor_token {
            Some(token) => Some(
                cursor::decode(token)
                    .map_err(|e| ValidationError::new("cursor", e))?
                    .0,
            ),
            None => None,
        };

        let mut uow = self.store.begin().await?;
        let mut items = uow.page_party_transactions(&party, before, limit + 1).await?;
        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            items.last().map(|last| cursor::encode(last.sequence, last.id))
        } else {
            None
        };

        Ok(TransactionPage { items, next_cursor })
    }

    /// Credits a wallet from a `wallet_funding` charge.
    pub async fn apply_funding(&self, party: Party, capture: &ChargeCapture) -> ServiceResult<Disposition> {
        let result = self.apply_funding_inner(party, capture).await;
        self.ledger.quarantine_on_inconsistency(result).await
    }

    async fn apply_funding_inner(&self, party: Party, capture: &ChargeCapture) -> ServiceResult<Disposition> {
        validation::validate_amount("amount", &capture.amount)?;

        let mut entry = ProposedTransaction::credit(
            party,
            TransactionType::WalletFunding,
            capture.amount.clone(),
            capture.ledger_reference(),
        )
        .with_description("Wallet funding")
        .with_metadata(serde_json::json!({ "paymentReference": capture.payment_reference }));
        if let Some(provider_id) = &capture.provider_id {
            entry = entry.with_provider_reference(provider_id.clone());
        }
        entry = match party.kind {
            PartyKind::User => entry.for_user(party.id),
            PartyKind::Business => entry.for_business(party.id),
            PartyKind::Platform => entry,
        };

        let mut uow = self.store.begin().await?;
        match self.ledger.append(uow.as_mut(), entry).await? {
            Appended::AlreadyApplied(_) => Ok(Disposition::Duplicate),
            Appended::Applied(t) => {
                uow.commit().await?;
                tracing::info!("Funded wallet {} with {}", party, t.amount);
                Ok(Disposition::Processed)
            }
        }
    }

    /// Debits the wallet (PENDING) and hands the money to the provider.
    pub async fn withdraw(&self, party: Party, request: WithdrawalRequest) -> ServiceResult<WithdrawalReceipt> {
        validation::validate_amount("amount", &request.amount)?;
        let narration = request
            .narration
            .as_deref()
            .map(validation::sanitize_string)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Wallet withdrawal".to_string());
        validation::validate_max_len("narration", &narration, validation::NARRATION_MAX_LEN)?;

        let result = self.book_withdrawal(party, &request, &narration).await;
        let (reference, transfer) = self.ledger.quarantine_on_inconsistency(result).await?;

        let outcome = match self.provider.initiate_transfer(&transfer).await {
            Ok(receipt) => TransferOutcome::from_receipt(&receipt),
            Err(e) => {
                tracing::warn!("Withdrawal {} transfer call failed: {}", reference, e);
                TransferOutcome::from_error(&e)
            }
        };
        let otp_required = matches!(outcome, TransferOutcome::OtpRequired { .. });
        self.transfers.apply(&reference, outcome).await?;

        self.receipt(&reference, otp_required).await
    }

    async fn book_withdrawal(
        &self,
        party: Party,
        request: &WithdrawalRequest,
        narration: &str,
    ) -> ServiceResult<(String, TransferRequest)> {
        let mut uow = self.store.begin().await?;
        let wallet = uow
            .find_wallet(&party)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("wallet for {}", party)))?;
        if wallet.is_frozen() {
            return Err(LedgerError::WalletFrozen(party).into());
        }

        if wallet.pin_hash.is_none() {
            return Err(ServiceError::Forbidden(
                "a withdrawal PIN must be set before withdrawing".to_string(),
            ));
        }
        if !self.pin_matches(&wallet, &request.pin)? {
            tracing::warn!("Invalid PIN for withdrawal from {}", party);
            return Err(ServiceError::Forbidden("invalid PIN".to_string()));
        }

        let account = uow
            .find_bank_account(request.bank_account_id)
            .await?
            .filter(|account| account.owner == party)
            .ok_or_else(|| ServiceError::NotFound(format!("bank account {}", request.bank_account_id)))?;

        let reference = format!(
            "WDR-{}",
            &Uuid::new_v4().simple().to_string()[..16].to_uppercase()
        );
        let mut debit = ProposedTransaction::debit(
            party,
            TransactionType::Withdrawal,
            request.amount.clone(),
            reference.clone(),
        )
        .pending()
        .with_description(narration.to_string())
        .with_metadata(serde_json::json!({ "bankAccountId": account.id }));
        debit = match party.kind {
            PartyKind::User => debit.for_user(party.id),
            PartyKind::Business => debit.for_business(party.id),
            PartyKind::Platform => debit,
        };
        self.ledger.append(uow.as_mut(), debit).await?;
        uow.commit().await?;

        tracing::info!("Withdrawal {} of {} booked for {}", reference, request.amount, party);
        let transfer = TransferRequest {
            reference: reference.clone(),
            amount: request.amount.clone(),
            currency: self.currency.clone(),
            account_number: account.account_number,
            account_name: account.account_name,
            bank_code: account.bank_code,
            narration: narration.to_string(),
        };
        Ok((reference, transfer))
    }

    /// Completes an OTP-gated transfer. A rejected OTP leaves the transfer pending.
    pub async fn finalize_transfer_otp(&self, reference: &str, otp: &str) -> ServiceResult<WithdrawalReceipt> {
        validation::validate_otp(otp)?;
        if !self.provider.supports(Capability::ValidateTransferOtp) {
            return Err(ServiceError::Conflict("provider does not support transfer OTPs".to_string()));
        }

        let entry = {
            let mut uow = self.store.begin().await?;
            uow.find_transaction(reference)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("transfer {}", reference)))?
        };
        if !entry.kind.is_transfer() || entry.status != TransactionStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "transfer {} is not awaiting an OTP",
                reference
            )));
        }
        let transfer_code = entry
            .provider_reference
            .clone()
            .ok_or_else(|| ServiceError::Conflict(format!("transfer {} has no transfer code", reference)))?;

        let receipt = self.provider.validate_transfer_otp(&transfer_code, otp).await?;
        let outcome = TransferOutcome::from_receipt(&receipt);
        let otp_required = matches!(outcome, TransferOutcome::OtpRequired { .. });
        self.transfers.apply(reference, outcome).await?;

        self.receipt(reference, otp_required).await
    }

    async fn receipt(&self, reference: &str, otp_required: bool) -> ServiceResult<WithdrawalReceipt> {
        let mut uow = self.store.begin().await?;
        let entry = uow
            .find_transaction(reference)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transfer {}", reference)))?;
        Ok(WithdrawalReceipt {
            success: !matches!(
                entry.status,
                TransactionStatus::Failed | TransactionStatus::Reversed
            ),
            reference: entry.reference,
            status: entry.status,
            otp_required: otp_required && entry.status == TransactionStatus::Pending,
        })
    }
}
