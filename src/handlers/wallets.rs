use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{Party, PartyKind};
use crate::error::AppError;
use crate::services::wallet::WithdrawalRequest;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub otp: String,
}

/// `/wallets/platform/<any>` addresses the single platform wallet.
fn party_from_path(party_type: &str, party_id: Uuid) -> Result<Party, AppError> {
    let kind = PartyKind::from_path(party_type).map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(match kind {
        PartyKind::Platform => Party::platform(),
        kind => Party { kind, id: party_id },
    })
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path((party_type, party_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let party = party_from_path(&party_type, party_id)?;
    let balance = state.wallets.balance(party).await?;
    Ok(Json(balance))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path((party_type, party_id)): Path<(String, Uuid)>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let party = party_from_path(&party_type, party_id)?;
    let page = state
        .wallets
        .transactions(party, page.cursor.as_deref(), page.limit)
        .await?;
    Ok(Json(page))
}

pub async fn withdraw(
    State(state): State<AppState>,
    Path((party_type, party_id)): Path<(String, Uuid)>,
    Json(request): Json<WithdrawalRequest>,
) -> Result<impl IntoResponse, AppError> {
    let party = party_from_path(&party_type, party_id)?;
    let receipt = state.wallets.withdraw(party, request).await?;
    Ok(Json(receipt))
}

pub async fn submit_transfer_otp(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(request): Json<OtpRequest>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .wallets
        .finalize_transfer_otp(&reference, &request.otp)
        .await?;
    Ok(Json(receipt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_from_path() {
        let id = Uuid::new_v4();
        assert_eq!(party_from_path("business", id).unwrap(), Party::business(id));
        assert_eq!(party_from_path("platform", id).unwrap(), Party::platform());
        assert!(party_from_path("merchant", id).is_err());
    }
}
