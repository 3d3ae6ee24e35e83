//! Per-page LLM extraction call: one page of policy markdown in, a set
//! of candidate entities and relationships out (§4.T).

use std::collections::HashMap;
use std::time::Duration;

use refund_llm::{LlmClient, LlmError, ReasoningEffort};
use refund_retry::{retry_async, RetryConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawEntity {
    pub label: String,
    pub properties: HashMap<String, Value>,
    pub text_excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawRelationship {
    pub from_label: String,
    pub from_name: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub to_label: String,
    pub to_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PageExtraction {
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub relationships: Vec<RawRelationship>,
}

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a legal knowledge extractor for retail return policies. Extract \
every policy rule on this page as typed entities and the relationships between them, using the node labels and \
relationship types from the schema supplied. Every entity must include a 'name' property. Extract all numeric \
constraints (days, fees, percentages, dollar amounts) as their own properties, not embedded in prose.";

const PER_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Extracts entities/relationships from one page, with the adapter's
/// standard retry loop plus a generous per-call timeout, per §4.T.
pub async fn extract_page(
    llm: &LlmClient,
    model: &str,
    schema_summary: &str,
    page_text: &str,
) -> Result<PageExtraction, LlmError> {
    let prompt = format!(
        "SCHEMA TO USE:\n{schema_summary}\n\nPAGE CONTENT:\n{page_text}\n\n\
         Extract all entities and relationships present on this page using the schema above.",
    );
    let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::High);

    let config = RetryConfig::llm_default();
    let outcome = retry_async(
        &config,
        || async {
            tokio::time::timeout(
                PER_CALL_TIMEOUT,
                llm.generate_structured::<PageExtraction>(model, EXTRACTION_SYSTEM_PROMPT, &prompt, reasoning),
            )
            .await
            .unwrap_or_else(|_| Err(LlmError::Timeout))
        },
        is_transient,
    )
    .await?;

    Ok(outcome.value)
}

fn is_transient(err: &LlmError) -> bool {
    matches!(err, LlmError::Timeout | LlmError::RateLimited | LlmError::ConnectionReset(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_extraction_defaults_to_empty_vectors() {
        let extraction = PageExtraction::default();
        assert!(extraction.entities.is_empty());
        assert!(extraction.relationships.is_empty());
    }
}
