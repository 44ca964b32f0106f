//! Transactional outbox worker.
//!
//! Commands are written in the same unit of work as the state change that
//! caused them, then picked up here. A message is leased while it runs, so a
//! crashed worker's messages become due again once the lease expires.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::{OutboxCommand, OutboxMessage};
use crate::ports::{OutboxRepository, RepositoryResult, Store};
use crate::services::settlement::SettlementService;
use crate::services::ServiceResult;

const BATCH_SIZE: i64 = 20;
const LEASE_SECS: i64 = 120;
const MAX_ATTEMPTS: i32 = 10;

/// Wakes the worker after a commit that enqueued work.
#[derive(Clone)]
pub struct OutboxSignal {
    tx: mpsc::Sender<()>,
}

impl OutboxSignal {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// A full channel already guarantees a wake-up, so the send is best effort.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.completed + self.rescheduled + self.abandoned
    }
}

pub struct OutboxProcessor {
    store: Arc<dyn Store>,
    settlements: Arc<SettlementService>,
    backoff: ChronoDuration,
}

impl OutboxProcessor {
    pub fn new(store: Arc<dyn Store>, settlements: Arc<SettlementService>, backoff: Duration) -> Self {
        Self {
            store,
            settlements,
            backoff: ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::seconds(60)),
        }
    }

    /// Claims every due message once and runs it.
    pub async fn drain_once(&self, now: DateTime<Utc>) -> RepositoryResult<DrainReport> {
        let messages = {
            let mut uow = self.store.begin().await?;
            let claimed = uow
                .claim_due(now, now + ChronoDuration::seconds(LEASE_SECS), BATCH_SIZE)
                .await?;
            uow.commit().await?;
            claimed
        };

        if messages.is_empty() {
            return Ok(DrainReport::default());
        }
        tracing::debug!("Claimed {} outbox messages", messages.len());

        let outcomes = join_all(messages.iter().map(|message| self.run(message))).await;

        let mut report = DrainReport::default();
        for (message, outcome) in messages.iter().zip(outcomes) {
            let mut uow = self.store.begin().await?;
            match outcome {
                Ok(()) => {
                    uow.complete(message.id).await?;
                    report.completed += 1;
                }
                Err(e) if e.is_retryable() && message.attempts < MAX_ATTEMPTS => {
                    let at = Utc::now() + self.backoff * message.attempts.max(1);
                    tracing::warn!(
                        "Outbox message {} failed (attempt {}), retrying at {}: {}",
                        message.id,
                        message.attempts,
                        at,
                        e
                    );
                    uow.reschedule(message.id, at, &e.to_string()).await?;
                    report.rescheduled += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Outbox message {} abandoned after {} attempts: {}",
                        message.id,
                        message.attempts,
                        e
                    );
                    uow.abandon(message.id, &e.to_string()).await?;
                    report.abandoned += 1;
                }
            }
            uow.commit().await?;
        }

        Ok(report)
    }

    async fn run(&self, message: &OutboxMessage) -> ServiceResult<()> {
        match &message.command {
            OutboxCommand::SettleOrder { order_id } => {
                self.settlements.settle(*order_id).await?;
            }
            OutboxCommand::ExecutePayout { settlement_id } => {
                self.settlements.execute_payout(*settlement_id).await?;
            }
        }
        Ok(())
    }
}

/// Drains the outbox whenever it is signalled, and on a fixed poll interval
/// for delayed retries and messages left behind by other instances.
pub async fn run_outbox_worker(
    processor: Arc<OutboxProcessor>,
    mut wakeups: mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    tracing::info!("Outbox worker started (poll every {:?})", poll_interval);
    let mut signalled = true;

    loop {
        match processor.drain_once(Utc::now()).await {
            Ok(report) if report.total() > 0 => tracing::info!(
                "Outbox drained: {} completed, {} rescheduled, {} abandoned",
                report.completed,
                report.rescheduled,
                report.abandoned
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Outbox drain failed: {}", e),
        }

        if signalled {
            tokio::select! {
                wakeup = wakeups.recv() => {
                    if wakeup.is_none() {
                        signalled = false;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        } else {
            tokio::time::sleep(poll_interval).await;
        }
    }
}
