//! Component I: the single schema-enforced LLM call that turns a
//! normalized message into a [`Classification`] (§4.I).

use refund_core::{Classification, NormalizedMessage};
use refund_llm::{LlmClient, LlmError, ReasoningEffort};

const SYSTEM_PROMPT: &str = "You triage inbound customer-service email for an e-commerce retailer. \
Decide whether this message is a return request, a replacement request, a refund request, or none \
of those. Only the first 4000 characters of the body are shown to you; treat anything past that as \
unavailable, not as evidence of anything. Report a confidence between 0 and 1. If the sender clearly \
states an account or order identifier that differs from the From address, report it as explicit_user_id.";

fn build_user_prompt(message: &NormalizedMessage) -> String {
    format!(
        "From: {}\nSubject: {}\n\nBody:\n{}",
        message.from_email,
        message.subject,
        message.classifier_excerpt(),
    )
}

/// Classifies one message. The prompt is built from [`NormalizedMessage::classifier_excerpt`]
/// only — callers must never pass full attachment bytes or the untruncated body here.
pub async fn classify(
    llm: &LlmClient,
    model: &str,
    message: &NormalizedMessage,
) -> Result<Classification, LlmError> {
    let user_prompt = build_user_prompt(message);
    let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::Low);
    llm.generate_structured::<Classification>(model, SYSTEM_PROMPT, &user_prompt, reasoning).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(body: &str) -> NormalizedMessage {
        NormalizedMessage {
            provider_id: "1".into(),
            received_at: Utc::now(),
            from_email: "a@example.com".into(),
            subject: "return my order".into(),
            body_text: body.into(),
            attachments: vec![],
        }
    }

    #[test]
    fn prompt_includes_from_subject_and_excerpt_not_full_body() {
        let mut m = msg("short body");
        m.body_text = "x".repeat(5000);
        let prompt = build_user_prompt(&m);
        assert!(prompt.contains("a@example.com"));
        assert!(prompt.contains("return my order"));
        assert_eq!(prompt.matches('x').count(), 4000);
    }
}
