use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Downstream work written in the same unit of work as the change that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxCommand {
    SettleOrder { order_id: Uuid },
    ExecutePayout { settlement_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub command: OutboxCommand,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(command: OutboxCommand, available_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            attempts: 0,
            available_at,
            locked_until: None,
            last_error: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Due and not leased by another worker.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.processed_at.is_none()
            && self.available_at <= now
            && self.locked_until.map_or(true, |until| until <= now)
    }
}

/// A verified webhook whose handling failed, kept for replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookFailure {
    pub id: Uuid,
    pub event: String,
    pub reference: Option<String>,
    pub payload: String,
    pub error: String,
    pub attempts: i32,
    pub replayed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookFailure {
    pub fn new(event: String, reference: Option<String>, payload: String, error: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event,
            reference,
            payload,
            error,
            attempts: 1,
            replayed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
