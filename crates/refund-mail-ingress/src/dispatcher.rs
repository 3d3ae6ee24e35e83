//! Component K: task dispatcher. Enqueues a processing task for a
//! persisted case envelope by posting its blob location to the case
//! worker's HTTP endpoint (§4.H step 6, §6).

use async_trait::async_trait;
use refund_error::{Classify, ErrorCode};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task queue unavailable: {0}")]
    Unavailable(String),
    #[error("task queue rejected the task: status {status}")]
    Rejected { status: u16 },
}

impl Classify for TaskQueueError {
    fn code(&self) -> ErrorCode {
        match self {
            TaskQueueError::Unavailable(_) => ErrorCode::ToolUnreachable,
            TaskQueueError::Rejected { .. } => ErrorCode::ToolArgumentInvalid,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPayload {
    pub bucket: String,
    pub blob_path: String,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, payload: TaskPayload) -> Result<(), TaskQueueError>;
}

/// Fronts the processing endpoint directly over HTTP with an OIDC
/// identity token, the same pattern the ingress handler's Cloud Run
/// deployment uses to reach the worker service (§6).
pub struct HttpTaskQueue {
    client: reqwest::Client,
    processor_url: String,
    service_account_email: String,
}

impl HttpTaskQueue {
    pub fn new(processor_url: impl Into<String>, service_account_email: impl Into<String>) -> Self {
        HttpTaskQueue {
            client: reqwest::Client::new(),
            processor_url: processor_url.into(),
            service_account_email: service_account_email.into(),
        }
    }

    /// Fetches a fresh OIDC identity token scoped to `processor_url` from
    /// the metadata server. Only reachable when running on GCP compute;
    /// callers outside that environment should use [`TaskQueue::enqueue`]
    /// against a fake in tests.
    async fn fetch_identity_token(&self) -> Result<String, TaskQueueError> {
        let url = format!(
            "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/{}/identity?audience={}",
            self.service_account_email, self.processor_url,
        );
        let resp = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| TaskQueueError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TaskQueueError::Rejected { status: resp.status().as_u16() });
        }
        resp.text().await.map_err(|e| TaskQueueError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    async fn enqueue(&self, payload: TaskPayload) -> Result<(), TaskQueueError> {
        let token = self.fetch_identity_token().await?;
        let resp = self
            .client
            .post(&self.processor_url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TaskQueueError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TaskQueueError::Rejected { status: resp.status().as_u16() })
        }
    }
}

/// In-memory queue used by tests and `/process-demo`, where the
/// handler and worker run in the same process.
pub mod fake {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryTaskQueue {
        pub enqueued: Mutex<Vec<TaskPayload>>,
    }

    #[async_trait]
    impl TaskQueue for InMemoryTaskQueue {
        async fn enqueue(&self, payload: TaskPayload) -> Result<(), TaskQueueError> {
            self.enqueued.lock().await.push(payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryTaskQueue;
    use super::*;

    #[tokio::test]
    async fn fake_queue_records_enqueued_payloads() {
        let queue = InMemoryTaskQueue::default();
        queue
            .enqueue(TaskPayload { bucket: "b".into(), blob_path: "a/b.json".into() })
            .await
            .unwrap();
        assert_eq!(queue.enqueued.lock().await.len(), 1);
    }
}
