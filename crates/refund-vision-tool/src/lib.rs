//! Component N: defect vision tool. One multimodal LLM call per image,
//! producing a one-sentence defect summary, `"Human review required"`
//! when the model can't commit to a description, or an error status
//! when the input itself is unusable (§5: 60s timeout).

use async_trait::async_trait;
use refund_llm::LlmClient;
use refund_tool_proto::{ToolHandler, ToolProtoError, ToolSpec};
use serde_json::Value;

const ANALYSIS_PROMPT: &str = "Describe any visible product defect in this image in one sentence, \
suitable for a customer-service case record. If the image does not clearly show a defect, or you \
are not confident, respond with exactly: Human review required.";

pub struct VisionToolHandler {
    llm: LlmClient,
    model: String,
}

impl VisionToolHandler {
    pub fn new(llm: LlmClient, model: impl Into<String>) -> Self {
        VisionToolHandler { llm, model: model.into() }
    }

    /// Direct in-process entry point for callers that already hold the
    /// image bytes (the case worker's attachment fan-out), bypassing the
    /// base64/JSON tool-protocol envelope `call_tool` exists for.
    pub async fn analyze_defect_bytes(&self, mime_type: &str, image_bytes: &[u8]) -> (String, DefectStatus) {
        let timeout = tokio::time::Duration::from_secs(60);
        let result = tokio::time::timeout(
            timeout,
            self.llm.generate_vision_text(&self.model, ANALYSIS_PROMPT, mime_type, image_bytes),
        )
        .await;

        match result {
            Ok(Ok(text)) => classify_description(text.trim()),
            Ok(Err(_)) | Err(_) => ("Human review required".to_string(), DefectStatus::HumanReviewRequired),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectStatus {
    Success,
    HumanReviewRequired,
    Error,
}

impl DefectStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DefectStatus::Success => "success",
            DefectStatus::HumanReviewRequired => "human_review_required",
            DefectStatus::Error => "error",
        }
    }
}

/// Classifies the model's free-text response into a status, mirroring
/// the original analyzer's substring checks on the returned text.
fn classify_description(description: &str) -> (String, DefectStatus) {
    let lowered = description.to_ascii_lowercase();
    if lowered.contains("human review required") {
        ("Human review required".to_string(), DefectStatus::HumanReviewRequired)
    } else if lowered.contains("error") {
        (description.to_string(), DefectStatus::Error)
    } else {
        (description.to_string(), DefectStatus::Success)
    }
}

#[async_trait]
impl ToolHandler for VisionToolHandler {
    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "analyze_defect_image".to_string(),
            description: "Summarizes a visible product defect from an image.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "base64_image": { "type": "string" },
                    "mime_type": { "type": "string" }
                },
                "required": ["base64_image", "mime_type"],
            }),
        }]
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, ToolProtoError> {
        if tool_name != "analyze_defect_image" {
            return Err(ToolProtoError::ToolNotFound(tool_name.to_string()));
        }
        refund_tool_proto::validate_required_keys(&self.tools()[0].input_schema, &arguments)?;

        let base64_image = arguments
            .get("base64_image")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolProtoError::ArgumentValidation("base64_image must be a string".into()))?;
        let mime_type = arguments
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("image/jpeg");

        let bytes = decode_base64(base64_image).map_err(ToolProtoError::ArgumentValidation)?;

        let (description, status) = self.analyze_defect_bytes(mime_type, &bytes).await;

        Ok(serde_json::json!({ "description": description, "status": status.as_str() }))
    }
}

fn decode_base64(input: &str) -> Result<Vec<u8>, String> {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let cleaned: Vec<u8> = input.bytes().filter(|b| *b != b'\n' && *b != b'\r' && *b != b'=').collect();
    let mut out = Vec::with_capacity(cleaned.len() * 3 / 4);
    for chunk in cleaned.chunks(4) {
        let vals: Vec<u8> = chunk
            .iter()
            .map(|b| value(*b).ok_or_else(|| format!("invalid base64 byte {b}")))
            .collect::<Result<_, _>>()?;
        match vals.len() {
            4 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
                out.push((vals[1] << 4) | (vals[2] >> 2));
                out.push((vals[2] << 6) | vals[3]);
            }
            3 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
                out.push((vals[1] << 4) | (vals[2] >> 2));
            }
            2 => out.push((vals[0] << 2) | (vals[1] >> 4)),
            _ => return Err("truncated base64 input".into()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_description_detects_human_review_phrase() {
        let (desc, status) = classify_description("Human Review Required");
        assert_eq!(desc, "Human review required");
        assert_eq!(status, DefectStatus::HumanReviewRequired);
    }

    #[test]
    fn classify_description_detects_error_phrase() {
        let (_, status) = classify_description("Error: could not read image");
        assert_eq!(status, DefectStatus::Error);
    }

    #[test]
    fn classify_description_otherwise_success() {
        let (desc, status) = classify_description("Cracked screen on the display.");
        assert_eq!(desc, "Cracked screen on the display.");
        assert_eq!(status, DefectStatus::Success);
    }

    #[tokio::test]
    async fn call_tool_rejects_unknown_tool_name() {
        let handler = VisionToolHandler::new(LlmClient::new("unused"), "gemini-2.5-pro");
        let err = handler.call_tool("nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolProtoError::ToolNotFound(_)));
    }
}
