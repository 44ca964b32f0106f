use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::AppState;

/// Provider callback. Any 2xx tells the provider to stop re-delivering, so a
/// 200 is only returned once the event is durably processed or dead-lettered.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|h| h.to_str().ok());

    let result = state.webhooks.handle(&body, signature).await?;
    tracing::debug!("Webhook handled: {:?}", result);

    Ok(Json(json!({ "status": "success" })))
}
