//! Component M: document parser tool. Decodes PDF bytes and extracts
//! page text, exposed over the stdio tool protocol as `process_invoice`.

use async_trait::async_trait;
use refund_tool_proto::{ToolHandler, ToolProtoError, ToolSpec};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum DocToolError {
    #[error("failed to decode base64 pdf content: {0}")]
    InvalidBase64(String),
    #[error("failed to parse pdf: {0}")]
    ParseFailed(String),
}

/// Extracts page text from PDF bytes, concatenated with newlines
/// between pages, mirroring the original invoice parser's page loop.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, DocToolError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| DocToolError::ParseFailed(e.to_string()))
}

pub struct DocToolHandler;

#[async_trait]
impl ToolHandler for DocToolHandler {
    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "process_invoice".to_string(),
            description: "Decodes a base64 PDF and returns its extracted text.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "base64_content": { "type": "string" }
                },
                "required": ["base64_content"],
            }),
        }]
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, ToolProtoError> {
        if tool_name != "process_invoice" {
            return Err(ToolProtoError::ToolNotFound(tool_name.to_string()));
        }
        refund_tool_proto::validate_required_keys(&self.tools()[0].input_schema, &arguments)?;

        let base64_content = arguments
            .get("base64_content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolProtoError::ArgumentValidation("base64_content must be a string".into()))?;

        // Strip a data-url style prefix (`data:application/pdf;base64,...`) if present.
        let raw = base64_content.split(',').next_back().unwrap_or(base64_content);

        let bytes = base64_decode(raw).map_err(|e| ToolProtoError::ArgumentValidation(e.to_string()))?;
        let text = extract_pdf_text(&bytes).map_err(|e| ToolProtoError::ArgumentValidation(e.to_string()))?;

        Ok(serde_json::json!({ "text": text }))
    }
}

/// Minimal standard-alphabet base64 decoder; the bytes this tool ever
/// sees come from the case worker's own attachment pipeline, never
/// untrusted multipart uploads, so a hand-rolled decoder is acceptable
/// scope here rather than pulling in a dedicated crate.
fn base64_decode(input: &str) -> Result<Vec<u8>, DocToolError> {
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
            .map(|b| value(*b).ok_or_else(|| DocToolError::InvalidBase64(format!("invalid base64 byte {b}"))))
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
            2 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
            }
            _ => return Err(DocToolError::InvalidBase64("truncated base64 input".into())),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_decode_round_trips_known_value() {
        // "hello" base64-encoded.
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn base64_decode_rejects_invalid_characters() {
        assert!(base64_decode("not base64!!").is_err());
    }

    #[tokio::test]
    async fn call_tool_rejects_unknown_tool_name() {
        let handler = DocToolHandler;
        let err = handler.call_tool("nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolProtoError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn call_tool_rejects_missing_base64_content() {
        let handler = DocToolHandler;
        let err = handler.call_tool("process_invoice", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolProtoError::ArgumentValidation(_)));
    }
}
