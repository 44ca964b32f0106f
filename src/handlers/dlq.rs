use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::ProcessingResult;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    #[serde(default)]
    pub include_replayed: bool,
    pub limit: Option<i64>,
}

pub async fn list_webhook_failures(
    State(state): State<AppState>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<Value>, AppError> {
    let entries = state
        .webhooks
        .failures(query.include_replayed, query.limit.unwrap_or(100))
        .await?;

    Ok(Json(json!({
        "dlq_entries": entries,
        "count": entries.len()
    })))
}

pub async fn replay_webhook_failure(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let result = state.webhooks.replay(id).await?;

    let (replayed, outcome) = match result {
        ProcessingResult::Processed => (true, "processed"),
        ProcessingResult::Duplicate => (true, "duplicate"),
        ProcessingResult::Ignored => (true, "ignored"),
        ProcessingResult::DeadLettered(_) => (false, "failed"),
    };

    Ok(Json(json!({
        "dlq_id": id,
        "replayed": replayed,
        "outcome": outcome
    })))
}
