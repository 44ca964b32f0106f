//! Order entity and the two status machines it carries.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::money;

string_enum! {
    /// Payment lifecycle of an order. Only the payment state machine writes it.
    pub enum PaymentStatus as "payment status" {
        Pending => "PENDING",
        Initiated => "INITIATED",
        Paid => "PAID",
        PartiallyPaid => "PARTIALLY_PAID",
        Failed => "FAILED",
        Expired => "EXPIRED",
        PartiallyRefunded => "PARTIALLY_REFUNDED",
        Refunded => "REFUNDED",
    }
}

impl PaymentStatus {
    /// Whether the machine may move from `self` to `next`.
    ///
    /// Refund reversal paths move backwards toward `PAID`; a capture reported
    /// after expiry or failure still lands as a payment.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Initiated)
                | (Initiated, Paid | PartiallyPaid | Failed | Expired)
                | (PartiallyPaid, Paid | PartiallyPaid | Expired)
                | (Expired, Paid | PartiallyPaid)
                | (Failed, Paid | PartiallyPaid)
                | (Paid, PartiallyRefunded | Refunded)
                | (PartiallyRefunded, PartiallyRefunded | Refunded | Paid)
                | (Refunded, PartiallyRefunded | Paid)
        )
    }

    pub fn accepts_capture(self) -> bool {
        self.can_transition_to(PaymentStatus::Paid)
    }

    pub fn is_refundable(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::PartiallyRefunded)
    }
}

string_enum! {
    /// Fulfillment lifecycle of an order.
    pub enum OrderStatus as "order status" {
        Pending => "PENDING",
        Confirmed => "CONFIRMED",
        Processing => "PROCESSING",
        Shipped => "SHIPPED",
        Delivered => "DELIVERED",
        Cancelled => "CANCELLED",
        Refunded => "REFUNDED",
    }
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Cancelled)
                | (Confirmed, Processing | Cancelled)
                | (Processing, Shipped | Cancelled)
                | (Shipped, Delivered)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub reference: String,
    pub business_id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub buyer_email: String,
    pub subtotal: BigDecimal,
    pub fees: BigDecimal,
    pub tax: BigDecimal,
    pub discount: BigDecimal,
    pub total: BigDecimal,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<String>,
    pub delivery_method: Option<String>,
    pub payment_reference: Option<String>,
    pub amount_paid: BigDecimal,
    pub amount_refunded: BigDecimal,
    pub initiated_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A fresh, unpaid order. Mostly useful for seeding.
    pub fn new(business_id: Uuid, buyer_email: impl Into<String>, total: BigDecimal) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            reference: format!("ORD-{}", &id.simple().to_string()[..12].to_uppercase()),
            business_id,
            buyer_id: None,
            buyer_email: buyer_email.into(),
            subtotal: total.clone(),
            fees: money::zero(),
            tax: money::zero(),
            discount: money::zero(),
            total,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_method: None,
            delivery_method: None,
            payment_reference: None,
            amount_paid: money::zero(),
            amount_refunded: money::zero(),
            initiated_at: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refundable_amount(&self) -> BigDecimal {
        &self.total - &self.amount_refunded
    }

    /// Payment status implied by the cumulative refunded amount.
    pub fn status_after_refunds(&self) -> PaymentStatus {
        if self.amount_refunded <= money::zero() {
            PaymentStatus::Paid
        } else if self.amount_refunded >= self.total {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        }
    }

    /// Payment status implied by the cumulative captured amount.
    pub fn status_after_captures(&self) -> PaymentStatus {
        if self.amount_paid >= self.total {
            PaymentStatus::Paid
        } else {
            PaymentStatus::PartiallyPaid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_payment_happy_path_transitions() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Initiated));
        assert!(PaymentStatus::Initiated.can_transition_to(PaymentStatus::Paid));
        assert!(PaymentStatus::Paid.can_transition_to(PaymentStatus::PartiallyRefunded));
        assert!(PaymentStatus::PartiallyRefunded.can_transition_to(PaymentStatus::Refunded));
    }

    #[test]
    fn test_payment_rejects_skips_and_regressions() {
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Paid));
        assert!(!PaymentStatus::Paid.can_transition_to(PaymentStatus::Initiated));
        assert!(!PaymentStatus::Paid.can_transition_to(PaymentStatus::Paid));
        assert!(!PaymentStatus::Refunded.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Failed.can_transition_to(PaymentStatus::Initiated));
    }

    #[test]
    fn test_late_capture_after_expiry() {
        assert!(PaymentStatus::Expired.accepts_capture());
        assert!(!PaymentStatus::Paid.accepts_capture());
    }

    #[test]
    fn test_fulfillment_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Shipped));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        assert_eq!(
            PaymentStatus::from_str("PARTIALLY_REFUNDED").unwrap(),
            PaymentStatus::PartiallyRefunded
        );
        assert!(PaymentStatus::from_str("paid").is_err());
        assert_eq!(OrderStatus::Cancelled.as_str(), "CANCELLED");
    }

    #[test]
    fn test_status_after_refunds() {
        let mut order = Order::new(Uuid::new_v4(), "a@b.co", BigDecimal::from(15000));
        order.amount_refunded = BigDecimal::from(5000);
        assert_eq!(order.status_after_refunds(), PaymentStatus::PartiallyRefunded);
        assert_eq!(order.refundable_amount(), BigDecimal::from(10000));
        order.amount_refunded = BigDecimal::from(15000);
        assert_eq!(order.status_after_refunds(), PaymentStatus::Refunded);
    }
}
