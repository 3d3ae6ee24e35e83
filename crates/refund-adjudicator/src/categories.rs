//! §4.Q.2 category classification: one LLM call per distinct set of
//! candidate categories, cached so a batch of cases against the same
//! compiled policy graph only pays for it once.

use std::collections::HashMap;

use refund_llm::{LlmClient, LlmError, ReasoningEffort};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const DEFAULT_CATEGORY: &str = "Most products";

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CategoryPick {
    category: String,
}

/// Caches the chosen category per distinct `(item description, available
/// categories)` pair for the lifetime of one `CategoryClassifier`.
pub struct CategoryClassifier {
    cache: Mutex<HashMap<String, String>>,
}

impl Default for CategoryClassifier {
    fn default() -> Self {
        CategoryClassifier { cache: Mutex::new(HashMap::new()) }
    }
}

impl CategoryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the single best-matching `Category.name` from
    /// `available_categories` for the given item description, falling
    /// back to [`DEFAULT_CATEGORY`] on empty input or persistent LLM
    /// failure, per §4.Q.2.
    pub async fn classify(
        &self,
        llm: &LlmClient,
        model: &str,
        item_description: &str,
        available_categories: &[String],
    ) -> String {
        if available_categories.is_empty() {
            return DEFAULT_CATEGORY.to_string();
        }
        if available_categories.iter().any(|c| c == DEFAULT_CATEGORY) && item_description.trim().is_empty() {
            return DEFAULT_CATEGORY.to_string();
        }

        let cache_key = format!("{item_description}\u{1}{}", available_categories.join(","));
        if let Some(cached) = self.cache.lock().await.get(&cache_key).cloned() {
            return cached;
        }

        let picked = self
            .classify_uncached(llm, model, item_description, available_categories)
            .await
            .unwrap_or_else(|_| fallback_category(available_categories));

        self.cache.lock().await.insert(cache_key, picked.clone());
        picked
    }

    async fn classify_uncached(
        &self,
        llm: &LlmClient,
        model: &str,
        item_description: &str,
        available_categories: &[String],
    ) -> Result<String, LlmError> {
        let prompt = format!(
            "Item description: {item_description}\nAvailable categories: {}\n\nPick the single best-matching \
             category name from the list above, exactly as written.",
            available_categories.join(", "),
        );
        let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::Low);
        let pick = llm
            .generate_structured::<CategoryPick>(
                model,
                "You classify a returned item into exactly one of a fixed set of policy categories.",
                &prompt,
                reasoning,
            )
            .await?;

        Ok(if available_categories.contains(&pick.category) {
            pick.category
        } else {
            fallback_category(available_categories)
        })
    }
}

fn fallback_category(available_categories: &[String]) -> String {
    if available_categories.iter().any(|c| c == DEFAULT_CATEGORY) {
        DEFAULT_CATEGORY.to_string()
    } else {
        available_categories.first().cloned().unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_category_list_falls_back_to_default() {
        let classifier = CategoryClassifier::new();
        let llm = LlmClient::new("unused-key".to_string());
        let picked = classifier.classify(&llm, "gemini-2.5-flash", "a blender", &[]).await;
        assert_eq!(picked, DEFAULT_CATEGORY);
    }

    #[test]
    fn fallback_prefers_default_category_when_present() {
        let categories = vec!["Electronics".to_string(), DEFAULT_CATEGORY.to_string()];
        assert_eq!(fallback_category(&categories), DEFAULT_CATEGORY);
    }

    #[test]
    fn fallback_uses_first_category_when_no_default_present() {
        let categories = vec!["Electronics".to_string(), "Apparel".to_string()];
        assert_eq!(fallback_category(&categories), "Electronics");
    }
}
