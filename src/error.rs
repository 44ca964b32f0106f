use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::ports::RepositoryError;
use crate::provider::ProviderError;
use crate::services::{LedgerError, ServiceError, WebhookError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Wallet frozen: {0}")]
    WalletFrozen(String),

    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("Ledger inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InsufficientFunds(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::WalletFrozen(_) => StatusCode::LOCKED,
            AppError::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::InternalInconsistency(_)
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidSignature => "INVALID_SIGNATURE",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Conflict(_) => "CONFLICT",
            AppError::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            AppError::WalletFrozen(_) => "WALLET_FROZEN",
            AppError::ProviderRejected(_) => "PROVIDER_REJECTED",
            AppError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            AppError::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            AppError::InternalInconsistency(_) => "INTERNAL_INCONSISTENCY",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text safe to show a client. Server-side failures are logged, not echoed.
    fn public_message(&self) -> String {
        match self {
            AppError::InternalInconsistency(_) => "Ledger inconsistency detected".to_string(),
            AppError::Database(_) | AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected(msg) => AppError::ProviderRejected(msg),
            ProviderError::Unavailable(msg) => AppError::ProviderUnavailable(msg),
            ProviderError::Timeout(msg) => AppError::ProviderTimeout(msg),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidEntry(msg) => AppError::Validation(msg),
            e @ LedgerError::InsufficientFunds { .. } => AppError::InsufficientFunds(e.to_string()),
            e @ LedgerError::WalletFrozen(_) => AppError::WalletFrozen(e.to_string()),
            e @ LedgerError::Inconsistency { .. } => AppError::InternalInconsistency(e.to_string()),
            LedgerError::NotFound(what) => AppError::NotFound(what),
            e @ LedgerError::InvalidTransition { .. } => AppError::Conflict(e.to_string()),
            LedgerError::Repository(e) => e.into(),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(e) => AppError::Validation(e.to_string()),
            ServiceError::NotFound(what) => AppError::NotFound(what),
            ServiceError::Conflict(msg) => AppError::Conflict(msg),
            ServiceError::Forbidden(msg) => AppError::Forbidden(msg),
            ServiceError::Ledger(e) => e.into(),
            ServiceError::Provider(e) => e.into(),
            ServiceError::Repository(e) => e.into(),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature => AppError::InvalidSignature,
            WebhookError::NotFound(id) => AppError::NotFound(format!("webhook failure {}", id)),
            WebhookError::Infrastructure(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed with {}: {}", status, self);
        }
        let body = Json(json!({
            "error": self.public_message(),
            "code": self.code(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
