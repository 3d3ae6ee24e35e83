//! Component G: tool client harness. Launches a tool server binary as a
//! subprocess, reads its hello frame, then multiplexes `call_tool`
//! requests over its stdin/stdout for the lifetime of the worker
//! process (§5: "tool-server subprocesses are per-worker, reused across
//! cases; on crash, the worker reinitializes them").

use std::process::Stdio;

use refund_error::{Classify, ErrorCode};
use refund_tool_proto::{send_frame, Frame, ToolSpec};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ToolClientError {
    #[error("failed to spawn tool server: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("tool server exited before hello handshake")]
    NoHello,
    #[error("tool server protocol violation: {0}")]
    Protocol(String),
    #[error("tool server process is gone")]
    ProcessGone,
    #[error("tool reported an error: {0}")]
    ToolError(String),
    #[error(transparent)]
    Proto(#[from] refund_tool_proto::ToolProtoError),
}

impl Classify for ToolClientError {
    fn code(&self) -> ErrorCode {
        match self {
            ToolClientError::Spawn(_) | ToolClientError::ProcessGone => ErrorCode::ToolUnreachable,
            ToolClientError::NoHello | ToolClientError::Protocol(_) => ErrorCode::ToolResultSchemaViolation,
            ToolClientError::ToolError(_) => ErrorCode::ToolArgumentInvalid,
            ToolClientError::Proto(_) => ErrorCode::ToolResultSchemaViolation,
        }
    }
}

/// A running tool-server subprocess with its stdio pipes wired up.
/// Calls are serialized through an internal mutex: the stdio protocol
/// is one request in flight at a time per subprocess, matching the
/// teacher's `SidecarClient` design.
pub struct ToolSession {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout_lines: Mutex<tokio::io::Lines<BufReader<ChildStdout>>>,
    pub server_name: String,
    pub tools: Vec<ToolSpec>,
}

impl ToolSession {
    /// Spawns `command` and performs the hello handshake, matching
    /// `SidecarClient::spawn`'s requirement that the first frame
    /// received must be `Hello`.
    pub async fn spawn(mut command: Command) -> Result<Self, ToolClientError> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(ToolClientError::Spawn)?;

        let stdin = child.stdin.take().ok_or(ToolClientError::NoHello)?;
        let stdout = child.stdout.take().ok_or(ToolClientError::NoHello)?;
        let mut lines = BufReader::new(stdout).lines();

        let hello_line = lines
            .next_line()
            .await
            .map_err(|e| ToolClientError::Protocol(e.to_string()))?
            .ok_or(ToolClientError::NoHello)?;
        let hello: Frame = serde_json::from_str(&hello_line).map_err(|e| ToolClientError::Protocol(e.to_string()))?;

        let server_name = match hello {
            Frame::Hello { server_name, .. } => server_name,
            other => return Err(ToolClientError::Protocol(format!("expected Hello, got {other:?}"))),
        };

        let mut session = ToolSession {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout_lines: Mutex::new(lines),
            server_name,
            tools: Vec::new(),
        };
        session.tools = session.list_tools().await?;
        Ok(session)
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolClientError> {
        self.send(&Frame::ListTools).await?;
        match self.recv().await? {
            Frame::ListToolsResult { tools } => Ok(tools),
            other => Err(ToolClientError::Protocol(format!("expected ListToolsResult, got {other:?}"))),
        }
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, ToolClientError> {
        debug!(target: "refund.tool_client", tool = %tool_name, server = %self.server_name, "calling tool");
        self.send(&Frame::CallTool { tool_name: tool_name.to_string(), arguments }).await?;
        match self.recv().await? {
            Frame::CallToolResult { result } => Ok(result),
            Frame::Error { message } => Err(ToolClientError::ToolError(message)),
            other => Err(ToolClientError::Protocol(format!("unexpected frame: {other:?}"))),
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), ToolClientError> {
        let mut stdin = self.stdin.lock().await;
        send_frame(&mut *stdin, frame).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, ToolClientError> {
        let mut lines = self.stdout_lines.lock().await;
        let line = lines
            .next_line()
            .await
            .map_err(|e| ToolClientError::Protocol(e.to_string()))?
            .ok_or(ToolClientError::ProcessGone)?;
        serde_json::from_str(&line).map_err(|e| ToolClientError::Protocol(e.to_string()))
    }

    /// True once the subprocess has exited, so the worker knows to
    /// respawn it on the next call.
    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(Some(_)))
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Holds one [`ToolSession`] per named tool server for a worker process,
/// respawning a session transparently if its subprocess has crashed.
pub struct ToolSessionPool {
    sessions: tokio::sync::RwLock<std::collections::HashMap<String, std::sync::Arc<ToolSession>>>,
}

impl ToolSessionPool {
    pub fn new() -> Self {
        ToolSessionPool {
            sessions: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn get_or_spawn(
        &self,
        name: &str,
        make_command: impl Fn() -> Command,
    ) -> Result<std::sync::Arc<ToolSession>, ToolClientError> {
        if let Some(session) = self.sessions.read().await.get(name) {
            if !session.has_exited().await {
                return Ok(session.clone());
            }
            warn!(target: "refund.tool_client", server = name, "tool server crashed, respawning");
        }

        let session = std::sync::Arc::new(ToolSession::spawn(make_command()).await?);
        self.sessions.write().await.insert(name.to_string(), session.clone());
        Ok(session)
    }
}

impl Default for ToolSessionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawning_a_nonexistent_binary_fails_to_spawn() {
        let command = Command::new("/nonexistent/refund-tool-server-binary");
        let result = ToolSession::spawn(command).await;
        assert!(matches!(result, Err(ToolClientError::Spawn(_))));
    }

    #[tokio::test]
    async fn session_pool_spawns_lazily_per_name() {
        let pool = ToolSessionPool::new();
        // No command will ever succeed here; we only assert that distinct
        // names are independent cache slots and errors propagate per call.
        let err = pool
            .get_or_spawn("doc_parser", || Command::new("/nonexistent/bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolClientError::Spawn(_)));
    }
}
