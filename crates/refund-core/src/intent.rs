//! §3.3 extracted order-intent: the single structured record (O) builds
//! by fusing email text, PDF text, and image findings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemCondition {
    NewUnopened,
    OpenedLikeNew,
    DamagedDefective,
    MissingParts,
    Unknown,
}

impl ItemCondition {
    /// §4.Q.2 fixed mapping from intent condition to the graph's
    /// canonical `Condition.name` string. Returns `None` when the
    /// mapping is intentionally empty (opened-like-new has no bearing on
    /// eligibility) — callers must record that as a non-exact mapping.
    pub fn canonical_condition_name(&self) -> Option<&'static str> {
        match self {
            ItemCondition::DamagedDefective => Some("Damaged, defective, or incorrect"),
            ItemCondition::NewUnopened => Some("Unopened"),
            ItemCondition::OpenedLikeNew => None,
            ItemCondition::MissingParts => Some("Missing parts"),
            ItemCondition::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReturnCategory {
    Return,
    Replacement,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnReasonCategory {
    ChangedMind,
    Defective,
    WrongItemSent,
    ArrivedLate,
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct OrderIntentItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i32>,
}

/// Every field is optional: this is a best-effort fusion of untrusted
/// customer-supplied content, not a validated record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct OrderIntent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_request_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub order_items: Vec<OrderIntentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_condition: Option<ItemCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_category: Option<ReturnCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_reason_category: Option<ReturnReasonCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

impl OrderIntent {
    /// A "strong identifier" per §4.P.1: presence of either drives the
    /// deterministic shortlist size down to 1.
    pub fn has_strong_identifier(&self) -> bool {
        self.invoice_number.is_some() || self.order_invoice_id.is_some()
    }

    pub fn is_empty_extraction(&self) -> bool {
        self.customer_email.is_none()
            && self.invoice_number.is_none()
            && self.order_invoice_id.is_none()
            && self.order_items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn damaged_condition_maps_to_canonical_string() {
        assert_eq!(
            ItemCondition::DamagedDefective.canonical_condition_name(),
            Some("Damaged, defective, or incorrect")
        );
    }

    #[test]
    fn opened_like_new_has_no_canonical_mapping() {
        assert_eq!(ItemCondition::OpenedLikeNew.canonical_condition_name(), None);
    }

    #[test]
    fn strong_identifier_detection() {
        let mut intent = OrderIntent::default();
        assert!(!intent.has_strong_identifier());
        intent.invoice_number = Some("INV-1".into());
        assert!(intent.has_strong_identifier());
    }

    #[test]
    fn empty_extraction_detection() {
        assert!(OrderIntent::default().is_empty_extraction());
        let mut intent = OrderIntent::default();
        intent.order_invoice_id = Some("OID-1".into());
        assert!(!intent.is_empty_extraction());
    }
}
