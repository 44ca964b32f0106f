//! Settlement of paid orders and payout to the merchant's bank account.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::domain::{
    money, OutboxCommand, Party, PaymentStatus, PayoutSchedule, ProposedTransaction, Settlement,
    SettlementMode, SettlementSplit, SettlementStatus, TransactionStatus, TransactionType,
};
use crate::ports::{
    LedgerRepository, OrderRepository, OutboxRepository, RepositoryResult, SettlementRepository,
    Store, UnitOfWork, WalletRepository,
};
use crate::provider::{PaymentProvider, TransferRequest};
use crate::services::ledger::{Ledger, LedgerError};
use crate::services::outbox::OutboxSignal;
use crate::services::transfers::{TransferOutcome, TransferResolver};
use crate::services::{ServiceError, ServiceResult};
use crate::validation::ValidationError;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettlementFilter {
    pub business_id: Option<Uuid>,
    pub status: Option<SettlementStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct SettlementService {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    ledger: Arc<Ledger>,
    transfers: Arc<TransferResolver>,
    config: SettlementConfig,
    currency: String,
    signal: OutboxSignal,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        ledger: Arc<Ledger>,
        transfers: Arc<TransferResolver>,
        config: SettlementConfig,
        currency: String,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            store,
            provider,
            ledger,
            transfers,
            config,
            currency,
            signal,
        }
    }

    pub fn mode(&self) -> SettlementMode {
        self.config.mode
    }

    /// Settles a PAID order exactly once. A second call returns the existing
    /// settlement untouched.
    pub async fn settle(&self, order_id: Uuid) -> ServiceResult<Settlement> {
        let result = self.settle_inner(order_id).await;
        self.ledger.quarantine_on_inconsistency(result).await
    }

    async fn settle_inner(&self, order_id: Uuid) -> ServiceResult<Settlement> {
        let mut uow = self.store.begin().await?;
        let order = uow
            .lock_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        if let Some(existing) = uow.lock_settlement_for_order(order_id).await? {
            tracing::debug!("Order {} already settled as {}", order.reference, existing.reference);
            return Ok(existing);
        }

        if order.payment_status != PaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "order {} is {}, only PAID orders settle",
                order.reference, order.payment_status
            )));
        }

        let profile = uow
            .find_payout_profile(order.business_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("payout profile for business {}", order.business_id))
            })?;

        let split = SettlementSplit::compute(&order.total, &profile.revenue_share_percentage);
        let reference = format!("STL-{}", order.reference);
        let now = Utc::now();
        let mode = self.config.mode;

        // The platform collected the whole charge; only its fee stays there.
        let platform_debit = ProposedTransaction::debit(
            Party::platform(),
            TransactionType::Settlement,
            split.net.clone(),
            format!("{}-PLT", reference),
        )
        .for_order(order.id)
        .for_business(order.business_id)
        .with_description(format!("Settlement of {} to merchant", order.reference));
        self.ledger.append(uow.as_mut(), platform_debit).await?;

        let scheduled_for = match (mode, profile.schedule) {
            (SettlementMode::Subaccount, _) | (_, PayoutSchedule::Immediate) => now,
            (_, PayoutSchedule::NextDay) => self.config.next_batch_after(now),
        };

        let mut settlement = Settlement::new(
            reference.clone(),
            order.business_id,
            Some(order.id),
            split.clone(),
            &profile.bank_account,
            mode,
            scheduled_for,
        );

        match mode {
            SettlementMode::MainBalance => {
                let merchant_credit = ProposedTransaction::credit(
                    Party::business(order.business_id),
                    TransactionType::Settlement,
                    split.gross.clone(),
                    reference.clone(),
                )
                .with_fee(split.platform_fee.clone())
                .for_order(order.id)
                .for_business(order.business_id)
                .with_description(format!("Settlement for {}", order.reference));
                self.ledger.append(uow.as_mut(), merchant_credit).await?;

                uow.insert_settlement(&settlement).await?;
                uow.enqueue(
                    OutboxCommand::ExecutePayout {
                        settlement_id: settlement.id,
                    },
                    scheduled_for,
                )
                .await?;
            }
            SettlementMode::Subaccount => {
                settlement.status = SettlementStatus::Processing;
                settlement.settlement_data.subaccount_code = profile.subaccount_code.clone();
                uow.insert_settlement(&settlement).await?;
            }
        }

        uow.commit().await?;
        if mode == SettlementMode::MainBalance {
            self.signal.notify();
        }

        tracing::info!(
            "Settled order {} as {}: gross {}, fee {}, net {}, payout at {}",
            order.reference,
            settlement.reference,
            split.gross,
            split.platform_fee,
            split.net,
            scheduled_for
        );
        Ok(settlement)
    }

    /// Sends the payout for a settlement. PENDING and FAILED settlements start a
    /// new attempt under a fresh transfer reference. A PROCESSING settlement whose
    /// transfer is still unresolved is re-sent under its existing reference.
    pub async fn execute_payout(&self, settlement_id: Uuid) -> ServiceResult<Settlement> {
        let result = self.execute_payout_inner(settlement_id).await;
        self.ledger.quarantine_on_inconsistency(result).await
    }

    async fn execute_payout_inner(&self, settlement_id: Uuid) -> ServiceResult<Settlement> {
        let mut uow = self.store.begin().await?;
        let mut settlement = locked(uow.as_mut(), settlement_id).await?;

        let transfer_reference = match settlement.status {
            SettlementStatus::Pending | SettlementStatus::Failed => {
                if settlement.mode() == SettlementMode::Subaccount {
                    return Err(ServiceError::Conflict(format!(
                        "settlement {} is paid out by the provider",
                        settlement.reference
                    )));
                }
                let reference = settlement.next_transfer_reference();
                if !self.book_payout(uow.as_mut(), &mut settlement, &reference).await? {
                    uow.commit().await?;
                    return Ok(settlement);
                }
                reference
            }
            SettlementStatus::Processing => match unresolved_transfer(uow.as_mut(), &settlement).await? {
                Some(reference) => reference,
                None => {
                    tracing::debug!(
                        "Settlement {} is awaiting its transfer outcome",
                        settlement.reference
                    );
                    return Ok(settlement);
                }
            },
            SettlementStatus::Success => return Ok(settlement),
        };

        settlement.attempts += 1;
        settlement.status = SettlementStatus::Processing;
        settlement.transfer_reference = Some(transfer_reference.clone());
        uow.update_settlement(&settlement).await?;
        uow.commit().await?;
        drop(uow);

        let request = TransferRequest {
            reference: transfer_reference.clone(),
            amount: settlement.net_amount.clone(),
            currency: self.currency.clone(),
            account_number: settlement.account_number.clone(),
            account_name: settlement.account_name.clone(),
            bank_code: settlement.bank_code.clone(),
            narration: format!("Settlement {}", settlement.reference),
        };
        tracing::info!(
            "Sending payout {} of {} for {} (attempt {})",
            transfer_reference,
            settlement.net_amount,
            settlement.reference,
            settlement.attempts
        );

        let outcome = match self.provider.initiate_transfer(&request).await {
            Ok(receipt) => TransferOutcome::from_receipt(&receipt),
            Err(e) => {
                tracing::warn!("Payout {} transfer call failed: {}", transfer_reference, e);
                TransferOutcome::from_error(&e)
            }
        };
        self.transfers.apply(&transfer_reference, outcome).await?;

        self.get(settlement_id).await
    }

    /// Books the PENDING payout debit. Returns false, with the settlement marked
    /// FAILED, when the merchant balance cannot cover it.
    async fn book_payout(
        &self,
        uow: &mut dyn UnitOfWork,
        settlement: &mut Settlement,
        transfer_reference: &str,
    ) -> ServiceResult<bool> {
        let payout = ProposedTransaction::debit(
            Party::business(settlement.business_id),
            TransactionType::Payout,
            settlement.net_amount.clone(),
            transfer_reference,
        )
        .pending()
        .for_business(settlement.business_id)
        .with_description(format!("Payout for {}", settlement.reference));
        let payout = match settlement.order_id {
            Some(order_id) => payout.for_order(order_id),
            None => payout,
        };

        match self.ledger.append(uow, payout).await {
            Ok(_) => {
                settlement.settlement_data.last_error = None;
                Ok(true)
            }
            Err(LedgerError::InsufficientFunds {
                available,
                requested,
                ..
            }) => {
                settlement.status = SettlementStatus::Failed;
                settlement.settlement_data.last_error = Some(format!(
                    "insufficient merchant balance: available {}, requested {}",
                    available, requested
                ));
                uow.update_settlement(settlement).await?;
                tracing::warn!(
                    "Payout for {} not started: insufficient merchant balance",
                    settlement.reference
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-sends payouts left in PROCESSING since before the reconcile cutoff with
    /// their transfer debit still PENDING. Covers a crash between booking the debit
    /// and calling the provider, and transfers the provider never confirmed.
    /// Returns how many were re-sent.
    pub async fn reconcile_payouts(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let cutoff = self.config.reconcile_cutoff(now);
        let mut stuck = Vec::new();
        {
            let mut uow = self.store.begin().await?;
            for settlement in all_settlements(uow.as_mut(), None, SettlementStatus::Processing).await? {
                if settlement.mode() == SettlementMode::MainBalance
                    && settlement.updated_at < cutoff
                    && unresolved_transfer(uow.as_mut(), &settlement).await?.is_some()
                {
                    stuck.push(settlement.id);
                }
            }
        }

        let mut resent = 0;
        for id in stuck {
            match self.execute_payout(id).await {
                Ok(_) => resent += 1,
                Err(e) => tracing::error!("Reconciling payout for settlement {} failed: {}", id, e),
            }
        }
        Ok(resent)
    }

    /// Puts a FAILED settlement back in the payout queue.
    pub async fn retry(&self, settlement_id: Uuid) -> ServiceResult<Settlement> {
        let mut uow = self.store.begin().await?;
        let mut settlement = locked(uow.as_mut(), settlement_id).await?;

        if settlement.status != SettlementStatus::Failed {
            return Err(ServiceError::Conflict(format!(
                "settlement {} is {}, only FAILED settlements can be retried",
                settlement.reference, settlement.status
            )));
        }

        let now = Utc::now();
        settlement.status = SettlementStatus::Pending;
        settlement.scheduled_for = now;
        uow.update_settlement(&settlement).await?;
        uow.enqueue(
            OutboxCommand::ExecutePayout {
                settlement_id: settlement.id,
            },
            now,
        )
        .await?;
        uow.commit().await?;
        self.signal.notify();

        tracing::info!("Settlement {} queued for retry", settlement.reference);
        Ok(settlement)
    }

    /// Marks a subaccount settlement as confirmed by the provider.
    pub async fn confirm_subaccount(&self, settlement_id: Uuid) -> ServiceResult<Settlement> {
        let mut uow = self.store.begin().await?;
        let mut settlement = locked(uow.as_mut(), settlement_id).await?;

        if settlement.mode() != SettlementMode::Subaccount {
            return Err(ServiceError::Conflict(format!(
                "settlement {} is paid out by transfer",
                settlement.reference
            )));
        }
        match settlement.status {
            SettlementStatus::Success => return Ok(settlement),
            SettlementStatus::Processing => {}
            other => {
                return Err(ServiceError::Conflict(format!(
                    "settlement {} is {}",
                    settlement.reference, other
                )))
            }
        }

        settlement.status = SettlementStatus::Success;
        settlement.settled_at = Some(Utc::now());
        uow.update_settlement(&settlement).await?;
        uow.commit().await?;
        Ok(settlement)
    }

    /// Pays out a merchant's available balance, outside any order, less what
    /// queued settlements still need.
    pub async fn sweep(&self, business_id: Uuid) -> ServiceResult<Settlement> {
        let mut uow = self.store.begin().await?;
        let party = Party::business(business_id);
        let wallet = uow
            .find_wallet(&party)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("wallet for {}", party)))?;

        if wallet.is_frozen() {
            return Err(LedgerError::WalletFrozen(party).into());
        }

        // Queued payouts have no debit yet; their funds stay behind for them.
        let mut reserved = money::zero();
        for queued in all_settlements(uow.as_mut(), Some(business_id), SettlementStatus::Pending).await? {
            reserved += &queued.net_amount;
        }

        let sweepable = &wallet.balance - &reserved;
        if sweepable <= money::zero() {
            return Err(ValidationError::new("balance", "nothing available to sweep").into());
        }

        let profile = uow
            .find_payout_profile(business_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payout profile for business {}", business_id)))?;

        let split = SettlementSplit {
            gross: sweepable.clone(),
            platform_fee: money::zero(),
            net: sweepable,
        };
        let reference = format!("STL-SWP-{}", &Uuid::new_v4().simple().to_string()[..12].to_uppercase());
        let now = Utc::now();
        let settlement = Settlement::new(
            reference,
            business_id,
            None,
            split,
            &profile.bank_account,
            SettlementMode::MainBalance,
            now,
        );

        uow.insert_settlement(&settlement).await?;
        uow.enqueue(
            OutboxCommand::ExecutePayout {
                settlement_id: settlement.id,
            },
            now,
        )
        .await?;
        uow.commit().await?;
        self.signal.notify();

        tracing::info!(
            "Sweeping {} for business {} as {} ({} reserved for queued payouts)",
            settlement.net_amount,
            business_id,
            settlement.reference,
            reserved
        );
        Ok(settlement)
    }

    pub async fn get(&self, settlement_id: Uuid) -> ServiceResult<Settlement> {
        let mut uow = self.store.begin().await?;
        uow.find_settlement(settlement_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("settlement {}", settlement_id)))
    }

    pub async fn list(&self, filter: &SettlementFilter) -> ServiceResult<Vec<Settlement>> {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0).max(0);
        let mut uow = self.store.begin().await?;
        Ok(uow
            .list_settlements(filter.business_id, filter.status, limit, offset)
            .await?)
    }
}

/// The settlement's current transfer reference, if its debit is still PENDING.
async fn unresolved_transfer(
    uow: &mut dyn UnitOfWork,
    settlement: &Settlement,
) -> RepositoryResult<Option<String>> {
    let Some(reference) = settlement.transfer_reference.clone() else {
        return Ok(None);
    };
    let pending = uow
        .find_transaction(&reference)
        .await?
        .map_or(false, |entry| entry.status == TransactionStatus::Pending);
    Ok(pending.then_some(reference))
}

async fn locked(uow: &mut dyn UnitOfWork, settlement_id: Uuid) -> ServiceResult<Settlement> {
    uow.lock_settlement(settlement_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("settlement {}", settlement_id)))
}

/// Every settlement in `status`, read page by page.
async fn all_settlements(
    uow: &mut dyn UnitOfWork,
    business_id: Option<Uuid>,
    status: SettlementStatus,
) -> RepositoryResult<Vec<Settlement>> {
    let mut all = Vec::new();
    loop {
        let page = uow
            .list_settlements(business_id, Some(status), MAX_PAGE_SIZE, all.len() as i64)
            .await?;
        let fetched = page.len() as i64;
        all.extend(page);
        if fetched < MAX_PAGE_SIZE {
            return Ok(all);
        }
    }
}
