//! Component F: tool server harness. Stdio-framed JSON-RPC (MCP-style):
//! each tool server exposes `list_tools`/`call_tool` over newline-
//! delimited JSON frames on stdin/stdout (§6).
//!
//! This crate defines the wire envelope and the server-side dispatch
//! loop; `refund-tool-client` defines the subprocess-launching,
//! call-multiplexing client half that speaks the same frames.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ToolProtoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize frame: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize frame: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("tool arguments failed schema validation: {0}")]
    ArgumentValidation(String),
}

/// A single tool's declared name, human description, and JSON Schema
/// for its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One frame of the stdio protocol. Serialized one-per-line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello { server_name: String, tool_count: usize },
    ListTools,
    ListToolsResult { tools: Vec<ToolSpec> },
    CallTool { tool_name: String, arguments: Value },
    CallToolResult { result: Value },
    Error { message: String },
}

/// Implemented by each tool server (document parser, defect vision, DB
/// verification tools) to answer `list_tools`/`call_tool` requests.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn tools(&self) -> Vec<ToolSpec>;

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, ToolProtoError>;
}

/// Writes a single frame as one JSON line.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), ToolProtoError> {
    let mut line = serde_json::to_string(frame).map_err(ToolProtoError::Serialize)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Runs the server loop over an arbitrary reader/writer pair (so tests
/// can use in-memory pipes instead of real stdio).
pub async fn run_server<H, R, W>(handler: &H, reader: R, mut writer: W) -> Result<(), ToolProtoError>
where
    H: ToolHandler,
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let tools = handler.tools();
    send_frame(
        &mut writer,
        &Frame::Hello {
            server_name: "refund-tool-server".to_string(),
            tool_count: tools.len(),
        },
    )
    .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: Frame = serde_json::from_str(&line).map_err(ToolProtoError::Deserialize)?;

        match frame {
            Frame::ListTools => {
                send_frame(&mut writer, &Frame::ListToolsResult { tools: tools.clone() }).await?;
            }
            Frame::CallTool { tool_name, arguments } => {
                debug!(target: "refund.tool_proto", tool = %tool_name, "dispatching call_tool");
                match handler.call_tool(&tool_name, arguments).await {
                    Ok(result) => send_frame(&mut writer, &Frame::CallToolResult { result }).await?,
                    Err(err) => {
                        warn!(target: "refund.tool_proto", tool = %tool_name, error = %err, "call_tool failed");
                        send_frame(&mut writer, &Frame::Error { message: err.to_string() }).await?;
                    }
                }
            }
            other => {
                return Err(ToolProtoError::Protocol(format!("unexpected frame from client: {other:?}")));
            }
        }
    }

    Ok(())
}

/// Validates a `call_tool` argument object against a tool's declared
/// JSON Schema. Minimal structural check (required keys present, object
/// shape) rather than a full schema validator, since tool schemas in
/// this pipeline are flat objects of primitives.
pub fn validate_required_keys(schema: &Value, arguments: &Value) -> Result<(), ToolProtoError> {
    let required: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let obj = arguments
        .as_object()
        .ok_or_else(|| ToolProtoError::ArgumentValidation("arguments must be a JSON object".into()))?;

    let missing: Vec<&String> = required.iter().filter(|k| !obj.contains_key(*k)).collect();
    if !missing.is_empty() {
        return Err(ToolProtoError::ArgumentValidation(format!("missing required arguments: {missing:?}")));
    }
    Ok(())
}

/// Convenience registry so a tool server can implement [`ToolHandler`]
/// by registering a handful of named closures instead of a big `match`.
pub struct ToolRegistry {
    specs: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { specs: BTreeMap::new() }
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.specs.values().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        fn tools(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "echo".into(),
                description: "echoes its argument".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "value": { "type": "string" } },
                    "required": ["value"],
                }),
            }]
        }

        async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, ToolProtoError> {
            if tool_name != "echo" {
                return Err(ToolProtoError::ToolNotFound(tool_name.to_string()));
            }
            Ok(arguments)
        }
    }

    #[tokio::test]
    async fn server_sends_hello_then_answers_list_tools() {
        let (client_side, server_side) = duplex(4096);
        let (server_reader, server_writer) = tokio::io::split(server_side);
        let (mut client_reader, mut client_writer) = tokio::io::split(client_side);

        let handler = EchoHandler;
        let server = tokio::spawn(async move { run_server(&handler, server_reader, server_writer).await });

        let mut lines = BufReader::new(&mut client_reader).lines();
        let hello_line = lines.next_line().await.unwrap().unwrap();
        let hello: Frame = serde_json::from_str(&hello_line).unwrap();
        assert!(matches!(hello, Frame::Hello { tool_count: 1, .. }));

        send_frame(&mut client_writer, &Frame::ListTools).await.unwrap();
        let result_line = lines.next_line().await.unwrap().unwrap();
        let result: Frame = serde_json::from_str(&result_line).unwrap();
        match result {
            Frame::ListToolsResult { tools } => assert_eq!(tools[0].name, "echo"),
            other => panic!("unexpected frame: {other:?}"),
        }

        drop(client_writer);
        let _ = server.await;
    }

    #[test]
    fn validate_required_keys_flags_missing_field() {
        let schema = serde_json::json!({ "required": ["order_invoice_id"] });
        let args = serde_json::json!({});
        assert!(validate_required_keys(&schema, &args).is_err());

        let args_ok = serde_json::json!({ "order_invoice_id": "OID-1" });
        assert!(validate_required_keys(&schema, &args_ok).is_ok());
    }
}
