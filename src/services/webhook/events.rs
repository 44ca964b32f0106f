//! Typed provider events.
//!
//! The provider sends `{ "event": "<name>", "data": { ... } }`. Known names map
//! to a variant with a strict payload; anything else is `Unknown` and ignored.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{Party, PartyKind};
use crate::provider::client::id_to_string;
use crate::services::payments::ChargeCapture;

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChargeData {
    pub reference: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub amount: Option<BigDecimal>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gateway_response: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferData {
    pub reference: String,
    #[serde(default)]
    pub transfer_code: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RefundData {
    pub reference: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    ChargeSuccess(ChargeData),
    ChargeFailed(ChargeData),
    TransferSuccess(TransferData),
    TransferFailed(TransferData),
    TransferReversed(TransferData),
    RefundProcessed(RefundData),
    RefundFailed(RefundData),
    Unknown(String),
}

/// Raised when a verified body cannot be read as an event.
#[derive(thiserror::Error, Debug)]
#[error("malformed {event} payload: {source}")]
pub struct MalformedEvent {
    pub event: String,
    #[source]
    pub source: serde_json::Error,
}

impl WebhookEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, MalformedEvent> {
        let envelope: RawEvent = serde_json::from_slice(raw).map_err(|source| MalformedEvent {
            event: "unknown".to_string(),
            source,
        })?;

        fn data<T: serde::de::DeserializeOwned>(name: &str, value: Value) -> Result<T, MalformedEvent> {
            serde_json::from_value(value).map_err(|source| MalformedEvent {
                event: name.to_string(),
                source,
            })
        }

        let RawEvent { event, data: value } = envelope;
        Ok(match event.as_str() {
            "charge.success" => WebhookEvent::ChargeSuccess(data(&event, value)?),
            "charge.failed" => WebhookEvent::ChargeFailed(data(&event, value)?),
            "transfer.success" => WebhookEvent::TransferSuccess(data(&event, value)?),
            "transfer.failed" => WebhookEvent::TransferFailed(data(&event, value)?),
            "transfer.reversed" => WebhookEvent::TransferReversed(data(&event, value)?),
            "refund.processed" => WebhookEvent::RefundProcessed(data(&event, value)?),
            "refund.failed" => WebhookEvent::RefundFailed(data(&event, value)?),
            _ => WebhookEvent::Unknown(event),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            WebhookEvent::ChargeSuccess(_) => "charge.success",
            WebhookEvent::ChargeFailed(_) => "charge.failed",
            WebhookEvent::TransferSuccess(_) => "transfer.success",
            WebhookEvent::TransferFailed(_) => "transfer.failed",
            WebhookEvent::TransferReversed(_) => "transfer.reversed",
            WebhookEvent::RefundProcessed(_) => "refund.processed",
            WebhookEvent::RefundFailed(_) => "refund.failed",
            WebhookEvent::Unknown(name) => name,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            WebhookEvent::ChargeSuccess(c) | WebhookEvent::ChargeFailed(c) => Some(&c.reference),
            WebhookEvent::TransferSuccess(t)
            | WebhookEvent::TransferFailed(t)
            | WebhookEvent::TransferReversed(t) => Some(&t.reference),
            WebhookEvent::RefundProcessed(r) | WebhookEvent::RefundFailed(r) => Some(&r.reference),
            WebhookEvent::Unknown(_) => None,
        }
    }
}

impl ChargeData {
    pub fn provider_id(&self) -> Option<String> {
        self.id.as_ref().and_then(id_to_string)
    }

    /// The capture this event reports, if it carries an amount.
    pub fn capture(&self) -> Option<ChargeCapture> {
        Some(ChargeCapture {
            payment_reference: self.reference.clone(),
            provider_id: self.provider_id(),
            amount: self.amount.clone()?,
            paid_at: self.paid_at,
        })
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    /// The wallet to credit when the charge funds a wallet rather than an order.
    pub fn funding_party(&self) -> Option<Result<Party, String>> {
        if self.metadata_str("purpose") != Some("wallet_funding") {
            return None;
        }
        let kind = self
            .metadata_str("partyType")
            .ok_or_else(|| "wallet funding without partyType".to_string())
            .and_then(|kind| PartyKind::from_path(kind).map_err(|e| e.to_string()));
        let party = kind.and_then(|kind| match kind {
            PartyKind::Platform => Ok(Party::platform()),
            _ => self
                .metadata_str("partyId")
                .ok_or_else(|| "wallet funding without partyId".to_string())
                .and_then(|id| Uuid::parse_str(id).map_err(|e| e.to_string()))
                .map(|id| Party { kind, id }),
        });
        Some(party)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> WebhookEvent {
        WebhookEvent::parse(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_charge_success_parses() {
        let event = parse(json!({
            "event": "charge.success",
            "data": {
                "id": 302961,
                "reference": "PAY-ORD-1",
                "amount": "15000.00",
                "paid_at": "2024-05-01T10:00:00.000Z",
                "metadata": { "purpose": "order_payment" }
            }
        }));
        let WebhookEvent::ChargeSuccess(data) = event else {
            panic!("expected charge.success");
        };
        let capture = data.capture().unwrap();
        assert_eq!(capture.provider_id.as_deref(), Some("302961"));
        assert_eq!(capture.ledger_reference(), "PAY-ORD-1-302961");
        assert!(data.funding_party().is_none());
    }

    #[test]
    fn test_unknown_event_is_ignored_not_rejected() {
        let event = parse(json!({ "event": "subscription.create", "data": { "x": 1 } }));
        assert_eq!(event, WebhookEvent::Unknown("subscription.create".to_string()));
        assert_eq!(event.reference(), None);
    }

    #[test]
    fn test_known_event_with_bad_payload_is_malformed() {
        let err = WebhookEvent::parse(br#"{"event":"transfer.success","data":{"amount":1}}"#).unwrap_err();
        assert_eq!(err.event, "transfer.success");
        assert!(WebhookEvent::parse(b"not json").is_err());
    }

    #[test]
    fn test_wallet_funding_party() {
        let user = Uuid::new_v4();
        let event = parse(json!({
            "event": "charge.success",
            "data": {
                "reference": "FND-1",
                "amount": 500,
                "metadata": { "purpose": "wallet_funding", "partyType": "user", "partyId": user.to_string() }
            }
        }));
        let WebhookEvent::ChargeSuccess(data) = event else {
            panic!("expected charge.success");
        };
        assert_eq!(data.funding_party(), Some(Ok(Party::user(user))));
    }
}
