use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::settlement::SettlementFilter;
use crate::AppState;

pub async fn settle_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let settlement = state.settlements.settle(order_id).await?;
    Ok((StatusCode::CREATED, Json(settlement)))
}

pub async fn list_settlements(
    State(state): State<AppState>,
    Query(filter): Query<SettlementFilter>,
) -> Result<impl IntoResponse, AppError> {
    let settlements = state.settlements.list(&filter).await?;
    Ok(Json(settlements))
}

pub async fn get_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let settlement = state.settlements.get(id).await?;
    Ok(Json(settlement))
}

pub async fn retry_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let settlement = state.settlements.retry(id).await?;
    Ok((StatusCode::ACCEPTED, Json(settlement)))
}
