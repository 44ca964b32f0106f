//! In-memory implementation of the storage ports.
//!
//! A unit of work holds the store's single lock for its whole lifetime and
//! works on a private copy of the state; `commit` publishes the copy. Units of
//! work are therefore fully serialized, which gives the same visibility rules
//! as row locks without any of the concurrency. Never begin a second unit of
//! work while holding one on the same task.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    money, BankAccount, Flow, Order, OutboxCommand, OutboxMessage, Party, PaymentStatus,
    PayoutProfile, Settlement, SettlementStatus, Transaction, TransactionStatus, Wallet,
    WebhookFailure,
};
use crate::ports::{
    LedgerRepository, OrderRepository, OutboxRepository, RepositoryError, RepositoryResult,
    SettlementRepository, Store, UnitOfWork, WalletRepository, WebhookDlqRepository,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    orders: HashMap<Uuid, Order>,
    transactions: Vec<Transaction>,
    next_sequence: i64,
    wallets: HashMap<Party, Wallet>,
    bank_accounts: HashMap<Uuid, BankAccount>,
    payout_profiles: HashMap<Uuid, PayoutProfile>,
    settlements: HashMap<Uuid, Settlement>,
    outbox: Vec<OutboxMessage>,
    webhook_failures: Vec<WebhookFailure>,
}

impl MemoryState {
    fn transaction_mut(&mut self, reference: &str) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|t| t.reference == reference)
    }

    fn outbox_mut(&mut self, id: Uuid) -> RepositoryResult<&mut OutboxMessage> {
        self.outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("outbox message {}", id)))
    }
}

/// Process-local store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard: Some(guard),
            working,
        }))
    }
}

pub struct MemoryUnitOfWork {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
}

impl MemoryUnitOfWork {
    fn state(&mut self) -> RepositoryResult<&mut MemoryState> {
        if self.guard.is_none() {
            return Err(RepositoryError::Closed);
        }
        Ok(&mut self.working)
    }
}

fn unique_violation(what: &str) -> RepositoryError {
    RepositoryError::Corrupt(format!("duplicate key: {}", what))
}

#[async_trait]
impl OrderRepository for MemoryUnitOfWork {
    async fn insert_order(&mut self, order: &Order) -> RepositoryResult<()> {
        let state = self.state()?;
        if state.orders.values().any(|o| o.reference == order.reference) {
            return Err(unique_violation(&order.reference));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(&mut self, id: Uuid) -> RepositoryResult<Option<Order>> {
        Ok(self.state()?.orders.get(&id).cloned())
    }

    async fn lock_order(&mut self, id: Uuid) -> RepositoryResult<Option<Order>> {
        self.find_order(id).await
    }

    async fn lock_order_by_payment_reference(
        &mut self,
        payment_reference: &str,
    ) -> RepositoryResult<Option<Order>> {
        Ok(self
            .state()?
            .orders
            .values()
            .find(|o| o.payment_reference.as_deref() == Some(payment_reference))
            .cloned())
    }

    async fn save_order(
        &mut self,
        order: &Order,
        expected: PaymentStatus,
    ) -> RepositoryResult<bool> {
        let state = self.state()?;
        match state.orders.get_mut(&order.id) {
            Some(stored) if stored.payment_status == expected => {
                let mut updated = order.clone();
                updated.total = stored.total.clone();
                updated.updated_at = Utc::now();
                *stored = updated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_stale_initiated_orders(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Order>> {
        let mut stale: Vec<Order> = self
            .state()?
            .orders
            .values()
            .filter(|o| o.payment_status == PaymentStatus::Initiated)
            .filter(|o| o.initiated_at.map_or(false, |at| at < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|o| o.initiated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait]
impl LedgerRepository for MemoryUnitOfWork {
    async fn find_transaction(&mut self, reference: &str) -> RepositoryResult<Option<Transaction>> {
        Ok(self
            .state()?
            .transactions
            .iter()
            .find(|t| t.reference == reference)
            .cloned())
    }

    async fn lock_transaction(&mut self, reference: &str) -> RepositoryResult<Option<Transaction>> {
        self.find_transaction(reference).await
    }

    async fn last_transaction(&mut self, party: &Party) -> RepositoryResult<Option<Transaction>> {
        Ok(self
            .state()?
            .transactions
            .iter()
            .filter(|t| &t.party == party)
            .max_by_key(|t| t.sequence)
            .cloned())
    }

    async fn insert_transaction(&mut self, entry: &Transaction) -> RepositoryResult<Transaction> {
        let state = self.state()?;
        if state.transactions.iter().any(|t| t.reference == entry.reference) {
            return Err(unique_violation(&entry.reference));
        }
        state.next_sequence += 1;
        let mut stored = entry.clone();
        stored.sequence = state.next_sequence;
        state.transactions.push(stored.clone());
        Ok(stored)
    }

    async fn update_transaction_status(
        &mut self,
        reference: &str,
        status: TransactionStatus,
        provider_reference: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let entry = self
            .state()?
            .transaction_mut(reference)
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", reference)))?;

        if entry.status != status && !entry.status.can_resolve_to(status) {
            return Err(RepositoryError::Corrupt(format!(
                "ledger entry {} cannot move from {} to {}",
                reference, entry.status, status
            )));
        }

        entry.status = status;
        if let Some(provider_reference) = provider_reference {
            entry.provider_reference = Some(provider_reference.to_string());
        }
        if settled_at.is_some() {
            entry.settled_at = settled_at;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn party_transactions(&mut self, party: &Party) -> RepositoryResult<Vec<Transaction>> {
        let mut chain: Vec<Transaction> = self
            .state()?
            .transactions
            .iter()
            .filter(|t| &t.party == party)
            .cloned()
            .collect();
        chain.sort_by_key(|t| t.sequence);
        Ok(chain)
    }

    async fn page_party_transactions(
        &mut self,
        party: &Party,
        before_sequence: Option<i64>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let mut page: Vec<Transaction> = self
            .state()?
            .transactions
            .iter()
            .filter(|t| &t.party == party)
            .filter(|t| before_sequence.map_or(true, |before| t.sequence < before))
            .cloned()
            .collect();
        page.sort_by_key(|t| std::cmp::Reverse(t.sequence));
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }

    async fn order_transactions(&mut self, order_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        let mut entries: Vec<Transaction> = self
            .state()?
            .transactions
            .iter()
            .filter(|t| t.order_id == Some(order_id))
            .cloned()
            .collect();
        entries.sort_by_key(|t| t.sequence);
        Ok(entries)
    }

    async fn pending_debit_total(&mut self, party: &Party) -> RepositoryResult<BigDecimal> {
        Ok(self
            .state()?
            .transactions
            .iter()
            .filter(|t| &t.party == party)
            .filter(|t| t.flow == Flow::Debit && t.status == TransactionStatus::Pending)
            .fold(money::zero(), |acc, t| acc - &t.net_amount))
    }
}

#[async_trait]
impl WalletRepository for MemoryUnitOfWork {
    async fn find_wallet(&mut self, party: &Party) -> RepositoryResult<Option<Wallet>> {
        Ok(self.state()?.wallets.get(party).cloned())
    }

    async fn lock_wallet(&mut self, party: &Party) -> RepositoryResult<Wallet> {
        Ok(self
            .state()?
            .wallets
            .entry(*party)
            .or_insert_with(|| Wallet::provision(*party))
            .clone())
    }

    async fn save_wallet(&mut self, wallet: &Wallet) -> RepositoryResult<()> {
        let mut updated = wallet.clone();
        updated.updated_at = Utc::now();
        self.state()?.wallets.insert(wallet.party, updated);
        Ok(())
    }

    async fn insert_bank_account(&mut self, account: &BankAccount) -> RepositoryResult<()> {
        self.state()?.bank_accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn find_bank_account(&mut self, id: Uuid) -> RepositoryResult<Option<BankAccount>> {
        Ok(self.state()?.bank_accounts.get(&id).cloned())
    }

    async fn save_payout_profile(&mut self, profile: &PayoutProfile) -> RepositoryResult<()> {
        let state = self.state()?;
        if !state.bank_accounts.contains_key(&profile.bank_account.id) {
            return Err(RepositoryError::NotFound(format!(
                "bank account {}",
                profile.bank_account.id
            )));
        }
        state.payout_profiles.insert(profile.business_id, profile.clone());
        Ok(())
    }

    async fn find_payout_profile(
        &mut self,
        business_id: Uuid,
    ) -> RepositoryResult<Option<PayoutProfile>> {
        Ok(self.state()?.payout_profiles.get(&business_id).cloned())
    }
}

#[async_trait]
impl SettlementRepository for MemoryUnitOfWork {
    async fn insert_settlement(&mut self, settlement: &Settlement) -> RepositoryResult<()> {
        let state = self.state()?;
        let clash = state.settlements.values().any(|s| {
            s.reference == settlement.reference
                || (settlement.order_id.is_some() && s.order_id == settlement.order_id)
        });
        if clash {
            return Err(unique_violation(&settlement.reference));
        }
        state.settlements.insert(settlement.id, settlement.clone());
        Ok(())
    }

    async fn find_settlement(&mut self, id: Uuid) -> RepositoryResult<Option<Settlement>> {
        Ok(self.state()?.settlements.get(&id).cloned())
    }

    async fn lock_settlement(&mut self, id: Uuid) -> RepositoryResult<Option<Settlement>> {
        self.find_settlement(id).await
    }

    async fn lock_settlement_for_order(
        &mut self,
        order_id: Uuid,
    ) -> RepositoryResult<Option<Settlement>> {
        Ok(self
            .state()?
            .settlements
            .values()
            .find(|s| s.order_id == Some(order_id))
            .cloned())
    }

    async fn lock_settlement_by_transfer(
        &mut self,
        transfer_reference: &str,
    ) -> RepositoryResult<Option<Settlement>> {
        Ok(self
            .state()?
            .settlements
            .values()
            .find(|s| s.transfer_reference.as_deref() == Some(transfer_reference))
            .cloned())
    }

    async fn update_settlement(&mut self, settlement: &Settlement) -> RepositoryResult<()> {
        let state = self.state()?;
        let stored = state
            .settlements
            .get_mut(&settlement.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("settlement {}", settlement.id)))?;
        *stored = settlement.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn list_settlements(
        &mut self,
        business_id: Option<Uuid>,
        status: Option<SettlementStatus>,
        limit: i64,
        offset: i64,
    ) -> RepositoryResult<Vec<Settlement>> {
        let mut rows: Vec<Settlement> = self
            .state()?
            .settlements
            .values()
            .filter(|s| business_id.map_or(true, |id| s.business_id == id))
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl OutboxRepository for MemoryUnitOfWork {
    async fn enqueue(
        &mut self,
        command: OutboxCommand,
        available_at: DateTime<Utc>,
    ) -> RepositoryResult<OutboxMessage> {
        let message = OutboxMessage::new(command, available_at);
        self.state()?.outbox.push(message.clone());
        Ok(message)
    }

    async fn claim_due(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<OutboxMessage>> {
        let state = self.state()?;
        let mut due: Vec<&mut OutboxMessage> = state
            .outbox
            .iter_mut()
            .filter(|m| m.is_claimable(now))
            .collect();
        due.sort_by_key(|m| m.available_at);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|m| {
                m.locked_until = Some(lease_until);
                m.attempts += 1;
                m.clone()
            })
            .collect())
    }

    async fn complete(&mut self, id: Uuid) -> RepositoryResult<()> {
        let message = self.state()?.outbox_mut(id)?;
        message.processed_at = Some(Utc::now());
        message.locked_until = None;
        Ok(())
    }

    async fn reschedule(
        &mut self,
        id: Uuid,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()> {
        let message = self.state()?.outbox_mut(id)?;
        message.available_at = available_at;
        message.locked_until = None;
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn abandon(&mut self, id: Uuid, error: &str) -> RepositoryResult<()> {
        let message = self.state()?.outbox_mut(id)?;
        message.processed_at = Some(Utc::now());
        message.locked_until = None;
        message.last_error = Some(error.to_string());
        Ok(())
    }
}

#[async_trait]
impl WebhookDlqRepository for MemoryUnitOfWork {
    async fn record_webhook_failure(&mut self, failure: &WebhookFailure) -> RepositoryResult<()> {
        self.state()?.webhook_failures.push(failure.clone());
        Ok(())
    }

    async fn find_webhook_failure(&mut self, id: Uuid) -> RepositoryResult<Option<WebhookFailure>> {
        Ok(self
            .state()?
            .webhook_failures
            .iter()
            .find(|f| f.id == id)
            .cloned())
    }

    async fn list_webhook_failures(
        &mut self,
        include_replayed: bool,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookFailure>> {
        let mut rows: Vec<WebhookFailure> = self
            .state()?
            .webhook_failures
            .iter()
            .filter(|f| include_replayed || f.replayed_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn save_webhook_failure(&mut self, failure: &WebhookFailure) -> RepositoryResult<()> {
        let state = self.state()?;
        let stored = state
            .webhook_failures
            .iter_mut()
            .find(|f| f.id == failure.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook failure {}", failure.id)))?;
        *stored = failure.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn commit(&mut self) -> RepositoryResult<()> {
        let mut guard = self.guard.take().ok_or(RepositoryError::Closed)?;
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncommitted_work_is_discarded() {
        let store = MemoryStore::new();
        let order = Order::new(Uuid::new_v4(), "buyer@example.com", BigDecimal::from(100));

        {
            let mut uow = store.begin().await.unwrap();
            uow.insert_order(&order).await.unwrap();
        }

        let mut uow = store.begin().await.unwrap();
        assert!(uow.find_order(order.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_committed_work_is_visible() {
        let store = MemoryStore::new();
        let order = Order::new(Uuid::new_v4(), "buyer@example.com", BigDecimal::from(100));

        let mut uow = store.begin().await.unwrap();
        uow.insert_order(&order).await.unwrap();
        uow.commit().await.unwrap();
        drop(uow);

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.find_order(order.id).await.unwrap(), Some(order));
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_expectation() {
        let store = MemoryStore::new();
        let mut order = Order::new(Uuid::new_v4(), "buyer@example.com", BigDecimal::from(100));

        let mut uow = store.begin().await.unwrap();
        uow.insert_order(&order).await.unwrap();

        order.payment_status = PaymentStatus::Initiated;
        assert!(uow.save_order(&order, PaymentStatus::Pending).await.unwrap());
        order.payment_status = PaymentStatus::Paid;
        assert!(!uow.save_order(&order, PaymentStatus::Pending).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_unit_of_work_rejects_calls() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.commit().await.unwrap();
        assert!(matches!(
            uow.find_order(Uuid::new_v4()).await,
            Err(RepositoryError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_claimed_messages_are_leased() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut uow = store.begin().await.unwrap();
        uow.enqueue(OutboxCommand::SettleOrder { order_id: Uuid::new_v4() }, now)
            .await
            .unwrap();
        let lease = now + chrono::Duration::seconds(60);
        assert_eq!(uow.claim_due(now, lease, 10).await.unwrap().len(), 1);
        assert!(uow.claim_due(now, lease, 10).await.unwrap().is_empty());
    }
}
