//! Append-only per-party ledger.
//!
//! Every balance movement goes through [`Ledger::append`] inside the caller's
//! unit of work. The wallet row lock serializes appends per party, so
//! `balance_before` of a new entry always equals `balance_after` of the
//! previous one.

use bigdecimal::BigDecimal;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{
    money, Flow, Party, ProposedTransaction, Transaction, TransactionStatus, TransactionType,
    WalletState,
};
use crate::ports::{LedgerRepository, RepositoryError, Store, UnitOfWork, WalletRepository};
use crate::services::{ServiceError, ServiceResult};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid ledger entry: {0}")]
    InvalidEntry(String),

    #[error("insufficient funds for {party}: available {available}, requested {requested}")]
    InsufficientFunds {
        party: Party,
        available: BigDecimal,
        requested: BigDecimal,
    },

    #[error("wallet for {0} is frozen")]
    WalletFrozen(Party),

    #[error("ledger inconsistency for {party}: {detail}")]
    Inconsistency { party: Party, detail: String },

    #[error("ledger entry {0} not found")]
    NotFound(String),

    #[error("ledger entry {reference} cannot move from {from} to {to}")]
    InvalidTransition {
        reference: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
    Applied(Transaction),
    /// An entry with the same reference already existed and was returned unchanged.
    AlreadyApplied(Transaction),
}

impl Appended {
    pub fn was_applied(&self) -> bool {
        matches!(self, Appended::Applied(_))
    }

    pub fn transaction(&self) -> &Transaction {
        match self {
            Appended::Applied(t) | Appended::AlreadyApplied(t) => t,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            Appended::Applied(t) | Appended::AlreadyApplied(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Transaction),
    /// The entry already carried the requested status.
    Unchanged(Transaction),
}

/// First broken link found while replaying a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBreak {
    pub sequence: i64,
    pub reference: String,
    pub expected_before: BigDecimal,
    pub recorded_before: BigDecimal,
    pub recorded_after: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub party: Party,
    pub entries: usize,
    pub replayed_balance: BigDecimal,
    pub wallet_balance: Option<BigDecimal>,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_consistent(&self) -> bool {
        self.first_break.is_none()
            && self
                .wallet_balance
                .as_ref()
                .map_or(true, |balance| balance == &self.replayed_balance)
    }
}

/// Replays `entries` (oldest first) from zero and returns the first entry whose
/// recorded balances do not follow from its predecessors.
pub fn verify_chain(entries: &[Transaction]) -> Result<BigDecimal, ChainBreak> {
    entries.iter().try_fold(money::zero(), |expected, entry| {
        if entry.balance_before != expected
            || entry.balance_after != &entry.balance_before + &entry.net_amount
        {
            return Err(ChainBreak {
                sequence: entry.sequence,
                reference: entry.reference.clone(),
                expected_before: expected,
                recorded_before: entry.balance_before.clone(),
                recorded_after: entry.balance_after.clone(),
            });
        }
        Ok(entry.balance_after.clone())
    })
}

fn validate(proposed: &ProposedTransaction) -> Result<(), LedgerError> {
    let zero = money::zero();
    if proposed.reference.trim().is_empty() {
        return Err(LedgerError::InvalidEntry("reference is required".to_string()));
    }
    if proposed.amount <= zero {
        return Err(LedgerError::InvalidEntry(format!(
            "{}: amount must be positive",
            proposed.reference
        )));
    }
    if proposed.fee < zero || proposed.fee > proposed.amount {
        return Err(LedgerError::InvalidEntry(format!(
            "{}: fee must be between 0 and the amount",
            proposed.reference
        )));
    }
    if !money::has_minor_precision(&proposed.amount) || !money::has_minor_precision(&proposed.fee) {
        return Err(LedgerError::InvalidEntry(format!(
            "{}: amounts carry at most two decimal places",
            proposed.reference
        )));
    }
    Ok(())
}

/// Builds the stored entry for `proposed` on top of `balance_before`.
fn build_entry(
    proposed: ProposedTransaction,
    balance_before: BigDecimal,
) -> Result<Transaction, LedgerError> {
    let net_amount = proposed.net_amount();
    let balance_after = &balance_before + &net_amount;

    if proposed.flow == Flow::Debit
        && proposed.kind.forbids_overdraft()
        && balance_after < money::zero()
    {
        return Err(LedgerError::InsufficientFunds {
            party: proposed.party,
            available: balance_before,
            requested: -net_amount,
        });
    }

    let now = Utc::now();
    let settled_at = (proposed.status == TransactionStatus::Success).then_some(now);
    Ok(Transaction {
        id: uuid::Uuid::new_v4(),
        sequence: 0,
        reference: proposed.reference,
        party: proposed.party,
        user_id: proposed.user_id,
        business_id: proposed.business_id,
        order_id: proposed.order_id,
        kind: proposed.kind,
        flow: proposed.flow,
        status: proposed.status,
        amount: proposed.amount,
        fee: proposed.fee,
        net_amount,
        balance_before,
        balance_after,
        provider_reference: proposed.provider_reference,
        description: proposed.description,
        metadata: proposed.metadata,
        created_at: now,
        updated_at: now,
        settled_at,
    })
}

pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Appends one entry to the party's chain and moves the wallet snapshot
    /// with it. A reference that already exists is returned unchanged.
    pub async fn append(
        &self,
        uow: &mut dyn UnitOfWork,
        proposed: ProposedTransaction,
    ) -> Result<Appended, LedgerError> {
        validate(&proposed)?;
        let party = proposed.party;

        let mut wallet = uow.lock_wallet(&party).await?;

        if let Some(existing) = uow.find_transaction(&proposed.reference).await? {
            if existing.party != party {
                return Err(LedgerError::InvalidEntry(format!(
                    "reference {} already belongs to {}",
                    existing.reference, existing.party
                )));
            }
            tracing::debug!("Ledger entry {} already applied", existing.reference);
            return Ok(Appended::AlreadyApplied(existing));
        }

        if wallet.is_frozen() {
            return Err(LedgerError::WalletFrozen(party));
        }

        let balance_before = uow
            .last_transaction(&party)
            .await?
            .map(|last| last.balance_after)
            .unwrap_or_else(money::zero);

        if balance_before != wallet.balance {
            return Err(LedgerError::Inconsistency {
                party,
                detail: format!(
                    "wallet snapshot {} does not match chain head {}",
                    wallet.balance, balance_before
                ),
            });
        }

        let entry = build_entry(proposed, balance_before)?;
        let stored = uow.insert_transaction(&entry).await?;

        wallet.balance = stored.balance_after.clone();
        uow.save_wallet(&wallet).await?;

        tracing::info!(
            "Ledger {} {} {} {} for {} (balance {} -> {})",
            stored.reference,
            stored.kind,
            stored.flow,
            stored.net_amount,
            party,
            stored.balance_before,
            stored.balance_after
        );
        Ok(Appended::Applied(stored))
    }

    /// Moves a PENDING (or SUCCESS, for reversals) entry to a terminal status.
    ///
    /// A debit or credit that fails or is reversed gets a compensating
    /// REVERSAL entry, so the balance effect is undone by a new entry rather
    /// than by touching the original.
    pub async fn resolve(
        &self,
        uow: &mut dyn UnitOfWork,
        reference: &str,
        to: TransactionStatus,
        provider_reference: Option<&str>,
    ) -> Result<Resolution, LedgerError> {
        let party = uow
            .find_transaction(reference)
            .await?
            .ok_or_else(|| LedgerError::NotFound(reference.to_string()))?
            .party;

        uow.lock_wallet(&party).await?;
        let current = uow
            .lock_transaction(reference)
            .await?
            .ok_or_else(|| LedgerError::NotFound(reference.to_string()))?;

        if current.status == to {
            return Ok(Resolution::Unchanged(current));
        }
        if !current.status.can_resolve_to(to) {
            return Err(LedgerError::InvalidTransition {
                reference: reference.to_string(),
                from: current.status,
                to,
            });
        }

        let settled_at = (to == TransactionStatus::Success).then(Utc::now);
        uow.update_transaction_status(reference, to, provider_reference, settled_at)
            .await?;

        if matches!(to, TransactionStatus::Failed | TransactionStatus::Reversed) {
            let compensation = compensation_for(&current);
            self.append(uow, compensation).await?;
        }

        let resolved = uow
            .find_transaction(reference)
            .await?
            .ok_or_else(|| LedgerError::NotFound(reference.to_string()))?;
        tracing::info!("Ledger {} resolved {} -> {}", reference, current.status, to);
        Ok(Resolution::Resolved(resolved))
    }

    /// Records the provider's code for an entry that stays PENDING.
    pub async fn attach_provider_reference(
        &self,
        uow: &mut dyn UnitOfWork,
        reference: &str,
        provider_reference: &str,
    ) -> Result<(), LedgerError> {
        let current = uow
            .lock_transaction(reference)
            .await?
            .ok_or_else(|| LedgerError::NotFound(reference.to_string()))?;
        if current.provider_reference.as_deref() == Some(provider_reference) {
            return Ok(());
        }
        uow.update_transaction_status(reference, current.status, Some(provider_reference), None)
            .await?;
        Ok(())
    }

    /// Freezes a wallet whose chain no longer matches its snapshot. Runs in
    /// its own unit of work, so the caller must have released theirs.
    pub async fn quarantine(&self, party: Party, detail: &str) -> Result<(), LedgerError> {
        let mut uow = self.store.begin().await?;
        let mut wallet = uow.lock_wallet(&party).await?;
        if wallet.state != WalletState::Frozen {
            wallet.state = WalletState::Frozen;
            uow.save_wallet(&wallet).await?;
            uow.commit().await?;
        }
        tracing::error!("Wallet {} frozen: {}", party, detail);
        Ok(())
    }

    /// Freezes the affected wallet when `result` reports an inconsistency and
    /// passes the result through.
    pub async fn quarantine_on_inconsistency<T>(&self, result: ServiceResult<T>) -> ServiceResult<T> {
        if let Err(ServiceError::Ledger(LedgerError::Inconsistency { party, detail })) = &result {
            if let Err(e) = self.quarantine(*party, detail).await {
                tracing::error!("Failed to freeze wallet {}: {}", party, e);
            }
        }
        result
    }

    /// Replays a party's whole chain and compares it with the wallet snapshot.
    pub async fn verify_party(&self, party: Party) -> Result<ChainReport, LedgerError> {
        let mut uow = self.store.begin().await?;
        let entries = uow.party_transactions(&party).await?;
        let wallet_balance = uow.find_wallet(&party).await?.map(|w| w.balance);
        drop(uow);

        let (replayed_balance, first_break) = match verify_chain(&entries) {
            Ok(balance) => (balance, None),
            Err(chain_break) => (chain_break.expected_before.clone(), Some(chain_break)),
        };

        Ok(ChainReport {
            party,
            entries: entries.len(),
            replayed_balance,
            wallet_balance,
            first_break,
        })
    }
}

fn compensation_for(original: &Transaction) -> ProposedTransaction {
    let flow = match original.flow {
        Flow::Debit => Flow::Credit,
        Flow::Credit => Flow::Debit,
    };
    let mut compensation = ProposedTransaction::new(
        original.party,
        TransactionType::Reversal,
        flow,
        original.amount.clone(),
        original.reversal_reference(),
    )
    .with_fee(original.fee.clone())
    .with_description(format!("Reversal of {}", original.reference))
    .with_metadata(serde_json::json!({ "reverses": original.reference }));
    compensation.user_id = original.user_id;
    compensation.business_id = original.business_id;
    compensation.order_id = original.order_id;
    compensation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use std::str::FromStr;
    use uuid::Uuid;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn ledger() -> (MemoryStore, Ledger) {
        let store = MemoryStore::new();
        let ledger = Ledger::new(Arc::new(store.clone()));
        (store, ledger)
    }

    #[tokio::test]
    async fn test_append_chains_balances() {
        let (store, ledger) = ledger();
        let party = Party::user(Uuid::new_v4());
        let mut uow = store.begin().await.unwrap();

        let first = ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::credit(party, TransactionType::WalletFunding, dec("100"), "F-1"),
            )
            .await
            .unwrap()
            .into_transaction();
        let second = ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::debit(party, TransactionType::Withdrawal, dec("30.50"), "W-1"),
            )
            .await
            .unwrap()
            .into_transaction();
        uow.commit().await.unwrap();

        assert_eq!(first.balance_before, dec("0"));
        assert_eq!(second.balance_before, first.balance_after);
        assert_eq!(second.balance_after, dec("69.50"));
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_duplicate_reference_is_a_no_op() {
        let (store, ledger) = ledger();
        let party = Party::platform();
        let mut uow = store.begin().await.unwrap();
        let entry = ProposedTransaction::credit(party, TransactionType::OrderPayment, dec("50"), "CAP-1");

        assert!(ledger.append(uow.as_mut(), entry.clone()).await.unwrap().was_applied());
        let again = ledger.append(uow.as_mut(), entry).await.unwrap();
        assert!(!again.was_applied());
        assert_eq!(uow.party_transactions(&party).await.unwrap().len(), 1);
        assert_eq!(uow.find_wallet(&party).await.unwrap().unwrap().balance, dec("50"));
    }

    #[tokio::test]
    async fn test_overdraft_rejected_for_withdrawals_only() {
        let (store, ledger) = ledger();
        let party = Party::platform();
        let mut uow = store.begin().await.unwrap();

        let err = ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::debit(party, TransactionType::Withdrawal, dec("1"), "W-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(uow.find_transaction("W-1").await.unwrap().is_none());

        let settled = ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::debit(party, TransactionType::Settlement, dec("1"), "S-1"),
            )
            .await
            .unwrap()
            .into_transaction();
        assert_eq!(settled.balance_after, dec("-1"));
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let (store, ledger) = ledger();
        let mut uow = store.begin().await.unwrap();
        let party = Party::platform();

        for (amount, fee) in [("0", "0"), ("-5", "0"), ("10", "11"), ("10.001", "0")] {
            let entry = ProposedTransaction::credit(party, TransactionType::Fee, dec(amount), "X")
                .with_fee(dec(fee));
            assert!(matches!(
                ledger.append(uow.as_mut(), entry).await,
                Err(LedgerError::InvalidEntry(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_failed_debit_is_compensated() {
        let (store, ledger) = ledger();
        let party = Party::business(Uuid::new_v4());
        let mut uow = store.begin().await.unwrap();
        ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::credit(party, TransactionType::Settlement, dec("100"), "S-1"),
            )
            .await
            .unwrap();
        ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::debit(party, TransactionType::Payout, dec("100"), "P-1").pending(),
            )
            .await
            .unwrap();

        let resolution = ledger
            .resolve(uow.as_mut(), "P-1", TransactionStatus::Failed, None)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Resolved(ref t) if t.status == TransactionStatus::Failed));

        let reversal = uow.find_transaction("P-1-REV").await.unwrap().unwrap();
        assert_eq!(reversal.kind, TransactionType::Reversal);
        assert_eq!(reversal.balance_after, dec("100"));

        let again = ledger
            .resolve(uow.as_mut(), "P-1", TransactionStatus::Failed, None)
            .await
            .unwrap();
        assert!(matches!(again, Resolution::Unchanged(_)));
        assert_eq!(uow.party_transactions(&party).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_cannot_become_success() {
        let (store, ledger) = ledger();
        let party = Party::business(Uuid::new_v4());
        let mut uow = store.begin().await.unwrap();
        ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::credit(party, TransactionType::Settlement, dec("10"), "S-1"),
            )
            .await
            .unwrap();
        ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::debit(party, TransactionType::Payout, dec("10"), "P-1").pending(),
            )
            .await
            .unwrap();
        ledger
            .resolve(uow.as_mut(), "P-1", TransactionStatus::Failed, None)
            .await
            .unwrap();

        let err = ledger
            .resolve(uow.as_mut(), "P-1", TransactionStatus::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_mismatch_freezes_wallet() {
        let (store, ledger) = ledger();
        let party = Party::user(Uuid::new_v4());
        {
            let mut uow = store.begin().await.unwrap();
            let mut wallet = uow.lock_wallet(&party).await.unwrap();
            wallet.balance = dec("999");
            uow.save_wallet(&wallet).await.unwrap();
            uow.commit().await.unwrap();
        }

        let result: ServiceResult<Appended> = async {
            let mut uow = store.begin().await?;
            let appended = ledger
                .append(
                    uow.as_mut(),
                    ProposedTransaction::credit(party, TransactionType::WalletFunding, dec("5"), "F-1"),
                )
                .await?;
            Ok(appended)
        }
        .await;
        let result = ledger.quarantine_on_inconsistency(result).await;
        assert!(matches!(
            result,
            Err(ServiceError::Ledger(LedgerError::Inconsistency { .. }))
        ));

        let mut uow = store.begin().await.unwrap();
        assert!(uow.find_wallet(&party).await.unwrap().unwrap().is_frozen());
        let err = ledger
            .append(
                uow.as_mut(),
                ProposedTransaction::credit(party, TransactionType::WalletFunding, dec("5"), "F-2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::WalletFrozen(_)));
    }

    #[tokio::test]
    async fn test_verify_chain_reports_first_break() {
        let (store, ledger) = ledger();
        let party = Party::platform();
        let mut uow = store.begin().await.unwrap();
        for (i, amount) in ["10", "20", "5"].iter().enumerate() {
            ledger
                .append(
                    uow.as_mut(),
                    ProposedTransaction::credit(party, TransactionType::Fee, dec(amount), format!("F-{}", i)),
                )
                .await
                .unwrap();
        }
        uow.commit().await.unwrap();

        let report = ledger.verify_party(party).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.replayed_balance, dec("35"));

        let mut uow = store.begin().await.unwrap();
        let mut entries = uow.party_transactions(&party).await.unwrap();
        entries[1].balance_before = dec("11");
        let chain_break = verify_chain(&entries).unwrap_err();
        assert_eq!(chain_break.reference, "F-1");
        assert_eq!(chain_break.expected_before, dec("10"));
    }
}
