//! Component H, tying A (cursor store), B (blob store), the mail
//! provider, the classifier (I), and the dispatcher (K) together into
//! the mail-ingress algorithm of §4.H.
//!
//! The cursor only ever advances after every message in a delta has
//! been fetched, normalized, classified, persisted, and (if
//! actionable) enqueued — a transient failure partway through a batch
//! aborts the whole handler run without moving the cursor, so the next
//! invocation simply replays the same delta (§3.6 invariant 2).

use refund_blob_store::BlobStore;
use refund_core::CaseEnvelope;
use refund_cursor_store::CursorStore;
use refund_error::{Classify, ErrorCode};
use refund_llm::LlmClient;
use tracing::{info, warn};

use crate::classifier::classify;
use crate::dispatcher::{TaskPayload, TaskQueue, TaskQueueError};
use crate::mime::normalize_message;
use crate::provider::{MailProvider, MailProviderError};

const CURSOR_NAME: &str = "gmail";

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    Provider(#[from] MailProviderError),
    #[error(transparent)]
    Cursor(#[from] refund_cursor_store::CursorStoreError),
    #[error(transparent)]
    Blob(#[from] refund_blob_store::BlobStoreError),
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
    #[error("classification failed: {0}")]
    Classification(#[from] refund_llm::LlmError),
}

impl Classify for IngressError {
    fn code(&self) -> ErrorCode {
        match self {
            IngressError::Provider(e) => e.code(),
            IngressError::Cursor(e) => e.code(),
            IngressError::Blob(e) => e.code(),
            IngressError::Queue(e) => e.code(),
            IngressError::Classification(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngressOutcome {
    /// History id the cursor was advanced to, if anything happened.
    pub advanced_to: Option<u64>,
    pub messages_seen: usize,
    pub messages_enqueued: usize,
    pub messages_skipped_gone: usize,
    pub messages_ignored_not_actionable: usize,
}

pub struct IngressHandler<P, C, B, Q> {
    provider: P,
    cursor_store: C,
    blob_store: B,
    task_queue: Q,
    llm: LlmClient,
    classifier_model: String,
    blob_bucket: String,
}

impl<P, C, B, Q> IngressHandler<P, C, B, Q>
where
    P: MailProvider,
    C: CursorStore,
    B: BlobStore,
    Q: TaskQueue,
{
    pub fn new(
        provider: P,
        cursor_store: C,
        blob_store: B,
        task_queue: Q,
        llm: LlmClient,
        classifier_model: impl Into<String>,
        blob_bucket: impl Into<String>,
    ) -> Self {
        IngressHandler {
            provider,
            cursor_store,
            blob_store,
            task_queue,
            llm,
            classifier_model: classifier_model.into(),
            blob_bucket: blob_bucket.into(),
        }
    }

    /// Runs one pubsub-triggered ingress pass: cold-start bootstrap on
    /// the first invocation, otherwise fetch-and-process the history
    /// delta since the last committed cursor.
    pub async fn handle_notification(&self) -> Result<IngressOutcome, IngressError> {
        let since = match self.cursor_store.read(CURSOR_NAME).await? {
            Some(cursor) => cursor,
            None => {
                let current = self.provider.current_history_id().await?;
                self.cursor_store.advance_to(CURSOR_NAME, current).await?;
                info!(target: "refund.mail_ingress", history_id = current, "cold-start cursor bootstrap");
                return Ok(IngressOutcome { advanced_to: Some(current), ..Default::default() });
            }
        };

        let (events, max_id) = self.provider.history_delta(since).await?;
        let mut outcome = IngressOutcome::default();

        for event in events {
            outcome.messages_seen += 1;
            match self.process_one(&event.message_id).await {
                Ok(true) => outcome.messages_enqueued += 1,
                Ok(false) => outcome.messages_ignored_not_actionable += 1,
                Err(IngressError::Provider(MailProviderError::MessageGone(_))) => {
                    warn!(target: "refund.mail_ingress", message_id = %event.message_id, "message gone before fetch, skipping");
                    outcome.messages_skipped_gone += 1;
                }
                Err(other) => return Err(other),
            }
        }

        if max_id > since {
            self.cursor_store.advance_to(CURSOR_NAME, max_id).await?;
            outcome.advanced_to = Some(max_id);
        }

        Ok(outcome)
    }

    /// Fetches, normalizes, classifies, and (if actionable) persists
    /// and enqueues a single message. Returns whether it was enqueued.
    async fn process_one(&self, message_id: &str) -> Result<bool, IngressError> {
        let raw = self.provider.fetch_message(message_id).await?;
        let normalized = normalize_message(&raw, &self.provider).await?;
        let classification = classify(&self.llm, &self.classifier_model, &normalized).await?;

        if !classification.category.is_actionable() {
            return Ok(false);
        }

        let envelope = CaseEnvelope::new(normalized, classification);
        let blob_path = envelope.message.blob_key();
        let bytes = serde_json::to_vec(&envelope).expect("envelope serializes");
        self.blob_store.put(&blob_path, bytes).await?;

        self.task_queue
            .enqueue(TaskPayload { bucket: self.blob_bucket.clone(), blob_path })
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{MimePart, RawMessage};
    use crate::provider::fake::FakeMailProvider;
    use refund_blob_store::fake::InMemoryBlobStore;
    use refund_cursor_store::fake::InMemoryCursorStore;
    use refund_llm::LlmClient;
    use std::collections::BTreeMap;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plain_message(id: &str, body: &str) -> RawMessage {
        let mut headers = BTreeMap::new();
        headers.insert("From".to_string(), "customer@example.com".to_string());
        headers.insert("Subject".to_string(), "I want a return".to_string());
        RawMessage {
            provider_id: id.to_string(),
            headers,
            payload: MimePart {
                content_type: "text/plain".to_string(),
                filename: None,
                attachment_id: None,
                inline_text: Some(body.to_string()),
                parts: vec![],
            },
            internal_date_epoch_millis: 1_700_000_000_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_bootstraps_cursor_without_processing() {
        let provider = FakeMailProvider::default();
        *provider.current.lock().unwrap() = 42;

        let server = MockServer::start().await;
        let llm = LlmClient::new("unused");

        let handler = IngressHandler::new(
            provider,
            InMemoryCursorStore::default(),
            InMemoryBlobStore::default(),
            crate::dispatcher::fake::InMemoryTaskQueue::default(),
            llm,
            "gemini-2.5-flash",
            "bucket",
        );

        let outcome = handler.handle_notification().await.unwrap();
        assert_eq!(outcome.advanced_to, Some(42));
        assert_eq!(outcome.messages_seen, 0);
        drop(server);
    }

    #[tokio::test(start_paused = true)]
    async fn actionable_message_is_persisted_and_enqueued() {
        let provider = FakeMailProvider::default();
        *provider.current.lock().unwrap() = 0;
        provider.events.lock().unwrap().push((1, crate::provider::HistoryEvent { message_id: "m1".into() }));
        provider.messages.lock().unwrap().insert("m1".into(), plain_message("m1", "please return my order"));

        let server = MockServer::start().await;
        let candidate = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": r#"{"category":"RETURN","confidence":0.9}"# }] }
            }]
        });
        Mock::given(method("POST"))
            .and(path_regex(r"/models/.*:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate))
            .mount(&server)
            .await;

        let cursor_store = InMemoryCursorStore::default();
        cursor_store.advance_to(CURSOR_NAME, 0).await.unwrap();

        let task_queue = crate::dispatcher::fake::InMemoryTaskQueue::default();
        let handler = IngressHandler::new(
            provider,
            cursor_store,
            InMemoryBlobStore::default(),
            task_queue,
            LlmClient::with_base_url("test-key", server.uri()),
            "gemini-2.5-flash",
            "bucket",
        );
        let outcome = handler.handle_notification().await.unwrap();
        assert_eq!(outcome.messages_seen, 1);
        assert_eq!(outcome.messages_enqueued, 1);
        assert_eq!(outcome.advanced_to, Some(1));
        assert_eq!(handler.task_queue.enqueued.lock().await.len(), 1);
    }
}
