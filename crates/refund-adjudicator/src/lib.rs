//! Component Q: the adjudicator. Given a verified order/customer match
//! and the extracted intent, walks the compiled policy graph and
//! produces a decision plus a customer-facing explanation (§4.Q).

pub mod categories;
pub mod citations;
pub mod decision;
pub mod traversal;

use chrono::{DateTime, Utc};
use refund_core::{ItemCondition, Order, OrderIntent, OrderItem};
use refund_error::{Classify, ErrorCode};
use refund_graph_store::{GraphStore, GraphStoreError};
use refund_llm::LlmClient;

pub use categories::CategoryClassifier;
pub use citations::{CitationResolver, PolicyDocError, PolicyDocSource};
pub use decision::{decide, explain_for_customer, ApplicableFee, Decision, DecisionResult};
pub use traversal::{traverse, PolicyTraversal};

#[derive(Debug, thiserror::Error)]
pub enum AdjudicatorError {
    #[error(transparent)]
    Graph(#[from] GraphStoreError),
    #[error(transparent)]
    Llm(#[from] refund_llm::LlmError),
    #[error(transparent)]
    PolicyDoc(#[from] PolicyDocError),
}

impl Classify for AdjudicatorError {
    fn code(&self) -> ErrorCode {
        match self {
            AdjudicatorError::Graph(e) => e.code(),
            AdjudicatorError::Llm(e) => e.code(),
            AdjudicatorError::PolicyDoc(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adjudication {
    pub decision: DecisionResult,
    pub customer_explanation: String,
    pub category_used: String,
    pub citations_with_excerpts: Vec<(String, Option<String>)>,
}

pub struct Adjudicator<'a> {
    graph: &'a GraphStore,
    llm: &'a LlmClient,
    model: String,
    categories: CategoryClassifier,
}

impl<'a> Adjudicator<'a> {
    pub fn new(graph: &'a GraphStore, llm: &'a LlmClient, model: impl Into<String>) -> Self {
        Adjudicator { graph, llm, model: model.into(), categories: CategoryClassifier::new() }
    }

    /// Runs the full §4.Q pipeline for one verified case: context
    /// build, condition normalization, category pick, graph traversal,
    /// source retrieval, decision, then customer explanation.
    pub async fn adjudicate(
        &self,
        order: &Order,
        items: &[OrderItem],
        intent: &OrderIntent,
        available_categories: &[String],
        policy_docs: &dyn PolicyDocSource,
        now: DateTime<Utc>,
    ) -> Result<Adjudication, AdjudicatorError> {
        let return_request_date = intent
            .return_request_date
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let days_since_delivery = order.days_since_delivery(return_request_date, now);

        let canonical_condition = intent
            .item_condition
            .unwrap_or(ItemCondition::Unknown)
            .canonical_condition_name();

        let item_description = items
            .iter()
            .map(|item| item.item_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let category = self
            .categories
            .classify(self.llm, &self.model, &item_description, available_categories)
            .await;

        let traversal = traverse(self.graph, &category).await?;

        let mut resolver = CitationResolver::new(policy_docs).await?;
        let mut citations_with_excerpts = Vec::new();
        for citation in &traversal.source_citations {
            let excerpt = resolver.resolve(citation).await;
            citations_with_excerpts.push((citation.clone(), excerpt));
        }

        let context_prompt = build_context_prompt(
            order,
            items,
            intent,
            days_since_delivery,
            canonical_condition,
            &category,
            &traversal,
            &citations_with_excerpts,
        );

        let decision = decide(self.llm, &self.model, &context_prompt).await?;
        let customer_explanation = explain_for_customer(self.llm, &self.model, &decision).await;

        Ok(Adjudication { decision, customer_explanation, category_used: category, citations_with_excerpts })
    }
}

#[allow(clippy::too_many_arguments)]
fn build_context_prompt(
    order: &Order,
    items: &[OrderItem],
    intent: &OrderIntent,
    days_since_delivery: i64,
    canonical_condition: Option<&'static str>,
    category: &str,
    traversal: &PolicyTraversal,
    citations_with_excerpts: &[(String, Option<String>)],
) -> String {
    let excerpts: String = citations_with_excerpts
        .iter()
        .filter_map(|(citation, excerpt)| excerpt.as_ref().map(|e| format!("[{citation}]\n{e}\n")))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Order total: {} {}\nDays since delivery: {days_since_delivery}\nItem condition: {}\n\
         Return reason: {}\nItems: {}\nPolicy category: {category}\n\n\
         Return windows: {}\nFees: {}\nRestrictions: {}\nRequired conditions: {}\nExcluded methods: {}\n\n\
         Cited policy text:\n{excerpts}",
        order.currency,
        order.total_amount,
        canonical_condition.unwrap_or("unknown"),
        intent.return_reason.as_deref().unwrap_or("not stated"),
        items.iter().map(|i| i.item_name.as_str()).collect::<Vec<_>>().join(", "),
        serde_json::to_string(&traversal.windows).unwrap_or_default(),
        serde_json::to_string(&traversal.fees).unwrap_or_default(),
        serde_json::to_string(&traversal.restrictions).unwrap_or_default(),
        serde_json::to_string(&traversal.required_conditions).unwrap_or_default(),
        serde_json::to_string(&traversal.excluded_methods).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use refund_core::{OrderIntent, OrderItem};
    use serde_json::Value;
    use uuid::Uuid;

    fn sample_order() -> Order {
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
            subtotal_amount: 100.0,
            discount_amount: 0.0,
            shipping_amount: 0.0,
            total_amount: 100.0,
            balance_due: 0.0,
            refunded_amount: 0.0,
            order_state: "DELIVERED".into(),
            delivered_at: None,
            seller_type: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn context_prompt_includes_days_since_delivery_and_category() {
        let order = sample_order();
        let intent = OrderIntent::default();
        let items: Vec<OrderItem> = vec![];
        let traversal = PolicyTraversal::default();
        let prompt = build_context_prompt(&order, &items, &intent, 14, Some("Unopened"), "Electronics", &traversal, &[]);
        assert!(prompt.contains("Days since delivery: 14"));
        assert!(prompt.contains("Electronics"));
        assert!(prompt.contains("Unopened"));
    }
}
