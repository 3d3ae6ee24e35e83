//! §3.2 orders entities (external store) and §3.2 `RefundCase`, the one
//! row this pipeline itself owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::mail::{Classification, MailCategory};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: Uuid,
    pub customer_email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub membership_tier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub invoice_number: String,
    pub order_invoice_id: String,
    pub customer_id: Uuid,
    pub order_date: Option<DateTime<Utc>>,
    pub ship_mode: Option<String>,
    pub ship_city: Option<String>,
    pub ship_state: Option<String>,
    pub ship_country: Option<String>,
    pub currency: String,
    pub subtotal_amount: f64,
    pub discount_amount: f64,
    pub shipping_amount: f64,
    pub total_amount: f64,
    pub balance_due: f64,
    pub refunded_amount: f64,
    pub order_state: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub seller_type: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Days between the customer's stated return-request date (falling
    /// back to "today") and delivery, per §4.Q.1. `9999` is the sentinel
    /// used when neither a request date nor a delivery date is known.
    pub fn days_since_delivery(&self, return_request_date: Option<DateTime<Utc>>, today: DateTime<Utc>) -> i64 {
        let Some(delivered_at) = self.delivered_at else {
            return 9999;
        };
        let reference = return_request_date.unwrap_or(today);
        (reference - delivered_at).num_days()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_item_id: Uuid,
    pub order_id: Uuid,
    pub sku: String,
    pub item_name: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub quantity: i32,
    pub unit_price: f64,
    pub line_total: f64,
    pub refunded_qty: i32,
    pub returned_qty: i32,
    pub metadata: Value,
}

/// §5: status may only be upgraded `PendingReview -> Verified`, never
/// downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    PendingReview,
}

impl VerificationStatus {
    /// True when transitioning from `self` to `next` is an allowed
    /// upgrade (or a no-op), false if it would be a downgrade.
    pub fn allows_transition_to(self, next: VerificationStatus) -> bool {
        match (self, next) {
            (VerificationStatus::Verified, VerificationStatus::PendingReview) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundCase {
    pub case_id: Uuid,
    pub case_source: String,
    pub source_message_id: String,
    pub received_at: DateTime<Utc>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub customer_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub extracted_invoice_number: Option<String>,
    pub extracted_order_invoice_id: Option<String>,
    pub classification: MailCategory,
    pub confidence: f64,
    pub verification_status: VerificationStatus,
    pub verification_notes: Option<String>,
    /// Metadata-only projection of attachments: filename + mime, never
    /// the bytes themselves (§3.6 invariant 6).
    pub attachments: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundCase {
    pub fn pending_review(
        source_message_id: String,
        received_at: DateTime<Utc>,
        from_email: String,
        subject: String,
        body: String,
        classification: Classification,
        notes: Option<String>,
    ) -> Self {
        let now = received_at;
        RefundCase {
            case_id: Uuid::new_v4(),
            case_source: "gmail".into(),
            source_message_id,
            received_at,
            from_email,
            from_name: None,
            subject,
            body,
            customer_id: None,
            order_id: None,
            extracted_invoice_number: None,
            extracted_order_invoice_id: None,
            classification: classification.category,
            confidence: classification.confidence,
            verification_status: VerificationStatus::PendingReview,
            verification_notes: notes,
            attachments: Value::Array(vec![]),
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_upgrade_allowed_but_not_downgrade() {
        assert!(VerificationStatus::PendingReview.allows_transition_to(VerificationStatus::Verified));
        assert!(!VerificationStatus::Verified.allows_transition_to(VerificationStatus::PendingReview));
        assert!(VerificationStatus::Verified.allows_transition_to(VerificationStatus::Verified));
    }

    #[test]
    fn days_since_delivery_sentinel_when_never_delivered() {
        let order = sample_order(None);
        let today: DateTime<Utc> = "2026-02-01T00:00:00Z".parse().unwrap();
        assert_eq!(order.days_since_delivery(None, today), 9999);
    }

    #[test]
    fn days_since_delivery_prefers_request_date() {
        let delivered: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let order = sample_order(Some(delivered));
        let requested: DateTime<Utc> = "2026-01-11T00:00:00Z".parse().unwrap();
        let today: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        assert_eq!(order.days_since_delivery(Some(requested), today), 10);
    }

    fn sample_order(delivered_at: Option<DateTime<Utc>>) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            invoice_number: "INV-1".into(),
            order_invoice_id: "OID-1".into(),
            customer_id: Uuid::new_v4(),
            order_date: None,
            ship_mode: None,
            ship_city: None,
            ship_state: None,
            ship_country: None,
            currency: "USD".into(),
            subtotal_amount: 0.0,
            discount_amount: 0.0,
            shipping_amount: 0.0,
            total_amount: 0.0,
            balance_due: 0.0,
            refunded_amount: 0.0,
            order_state: "DELIVERED".into(),
            delivered_at,
            seller_type: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
