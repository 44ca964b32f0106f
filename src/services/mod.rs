pub mod ledger;
pub mod outbox;
pub mod payments;
pub mod settlement;
pub mod sweeper;
pub mod transfers;
pub mod wallet;
pub mod webhook;

use thiserror::Error;

use crate::ports::RepositoryError;
use crate::provider::ProviderError;
use crate::validation::ValidationError;

pub use ledger::{Ledger, LedgerError};
pub use outbox::{run_outbox_worker, OutboxProcessor, OutboxSignal};
pub use payments::PaymentService;
pub use settlement::SettlementService;
pub use sweeper::{run_expiry_sweeper, run_payout_reconciler};
pub use transfers::{TransferOutcome, TransferResolver};
pub use wallet::WalletService;
pub use webhook::{ProcessingResult, WebhookError, WebhookProcessor};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ServiceError {
    /// Failures of the system of record itself, as opposed to the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ServiceError::Repository(_) | ServiceError::Ledger(LedgerError::Repository(_))
        )
    }

    /// Worth running again later without any change to the input.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Provider(e) => e.is_transient(),
            other => other.is_infrastructure(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// What an event-driven command did to stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// The stored state had moved past the event's predecessor; nothing changed.
    Stale,
}
