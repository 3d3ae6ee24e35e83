//! §4.Q.4/§4.Q.5 the two reasoning calls: the decision itself, then a
//! plain-text customer-facing explanation of it.

use refund_llm::{LlmClient, LlmError, ReasoningEffort};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Denied,
    ManualReview,
}

/// §4.Q.6 `applicable_fees[]` entry: a fee the policy graph surfaced as
/// potentially chargeable, plus whether the adjudicator waived it and
/// why, so the waiver survives into `refund_cases.metadata` rather than
/// collapsing into an opaque name string.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApplicableFee {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub waived: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionResult {
    pub decision: Decision,
    #[serde(default)]
    pub applicable_fees: Vec<ApplicableFee>,
    pub reasoning: String,
    #[serde(default)]
    pub policy_citations: Vec<String>,
}

const DECISION_SYSTEM_PROMPT: &str = "You are a refund-policy adjudicator. Decide APPROVED, DENIED, or \
MANUAL_REVIEW strictly from the policy context supplied; never invent a rule not present in it. When the \
context is insufficient or contradictory, choose MANUAL_REVIEW rather than guessing. Cite every rule you \
rely on by its source_citation.";

/// One schema-enforced reasoning call producing the adjudication
/// decision itself.
pub async fn decide(llm: &LlmClient, model: &str, context_prompt: &str) -> Result<DecisionResult, LlmError> {
    let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::High);
    llm.generate_structured::<DecisionResult>(model, DECISION_SYSTEM_PROMPT, context_prompt, reasoning).await
}

const EXPLANATION_SYSTEM_PROMPT: &str = "You write a short, plain-language explanation of a refund decision \
for the customer who requested it. Be direct and courteous. Do not mention internal system names, policy \
document filenames, or citation identifiers.";

/// Plain-text customer explanation of an already-made decision. Falls
/// back to the decision's own `reasoning` field on LLM failure, per
/// §4.Q.5, since the adjudication itself must not be blocked on this.
pub async fn explain_for_customer(llm: &LlmClient, model: &str, decision: &DecisionResult) -> String {
    let fees_summary = decision
        .applicable_fees
        .iter()
        .map(|fee| {
            if fee.waived {
                format!("{} (waived)", fee.name)
            } else {
                format!("{} ({})", fee.name, fee.value)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let prompt = format!(
        "Decision: {:?}\nApplicable fees: {}\nInternal reasoning: {}",
        decision.decision, fees_summary, decision.reasoning,
    );
    let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::Medium);
    match llm.generate_text(model, EXPLANATION_SYSTEM_PROMPT, &prompt, reasoning).await {
        Ok(text) => text,
        Err(err) => {
            warn!(target: "refund.adjudicator", error = %err, "customer explanation call failed, using raw reasoning");
            decision.reasoning.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_serializes_as_screaming_snake_case() {
        let value = serde_json::to_value(Decision::ManualReview).unwrap();
        assert_eq!(value, serde_json::json!("MANUAL_REVIEW"));
    }

    #[test]
    fn applicable_fee_round_trips_waiver_and_reason() {
        let fee = ApplicableFee {
            name: "restocking_fee".to_string(),
            value: 12.5,
            waived: true,
            reason: Some("first return within policy window".to_string()),
        };
        let value = serde_json::to_value(&fee).unwrap();
        assert_eq!(value["waived"], serde_json::json!(true));
        assert_eq!(value["reason"], serde_json::json!("first return within policy window"));
        let parsed: ApplicableFee = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.name, "restocking_fee");
    }

    #[test]
    fn applicable_fee_defaults_waived_false_when_absent() {
        let parsed: ApplicableFee =
            serde_json::from_value(serde_json::json!({ "name": "return_shipping", "value": 4.99 })).unwrap();
        assert!(!parsed.waived);
        assert!(parsed.reason.is_none());
    }
}
