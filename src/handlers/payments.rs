use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::domain::OrderStatus;
use crate::error::AppError;
use crate::services::payments::{InitializePayment, RefundCommand};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub order_id: Uuid,
    pub payment_method: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub transaction_reference: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
}

pub async fn initialize_payment(
    State(state): State<AppState>,
    Json(payload): Json<InitializeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .payments
        .initialize(
            payload.order_id,
            InitializePayment {
                payment_method: payload.payment_method,
                redirect_url: payload.redirect_url,
            },
        )
        .await?;

    Ok(Json(session))
}

pub async fn verify_payment(
    State(state): State<AppState>,
    Json(payload): Json<VerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let order = state.payments.verify(&payload.transaction_reference).await?;

    Ok(Json(json!({
        "orderId": order.id,
        "paymentStatus": order.payment_status,
    })))
}

pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(command): Json<RefundCommand>,
) -> Result<impl IntoResponse, AppError> {
    let summary = state.payments.refund(order_id, command).await?;
    Ok(Json(summary))
}

pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(update): Json<StatusUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let order = state.payments.update_status(order_id, update.status).await?;
    Ok(Json(order))
}

pub async fn get_order_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let summary = state.payments.summary(order_id).await?;
    Ok(Json(summary))
}
