//! The OAuth-protected mail provider is an external collaborator (§1);
//! this module only declares the named interface component H needs.

use async_trait::async_trait;
use refund_error::{Classify, ErrorCode};

use crate::mime::RawMessage;

#[derive(Debug, thiserror::Error)]
pub enum MailProviderError {
    #[error("mail provider unavailable: {0}")]
    Unavailable(String),
    /// A message referenced by a history delta was deleted before we
    /// could fetch it. Permanent, per §4.H: skip, don't block the rest.
    #[error("message {0} no longer exists")]
    MessageGone(String),
}

impl Classify for MailProviderError {
    fn code(&self) -> ErrorCode {
        match self {
            MailProviderError::Unavailable(_) => ErrorCode::ToolUnreachable,
            MailProviderError::MessageGone(_) => ErrorCode::ToolArgumentInvalid,
        }
    }
}

/// A single "message added" entry from the provider's history delta.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub message_id: String,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn current_history_id(&self) -> Result<u64, MailProviderError>;

    /// History delta from `since`, filtered to "message added" events,
    /// in provider order. Also returns the maximum history id observed,
    /// which may be larger than any individual event's id.
    async fn history_delta(&self, since: u64) -> Result<(Vec<HistoryEvent>, u64), MailProviderError>;

    async fn fetch_message(&self, message_id: &str) -> Result<RawMessage, MailProviderError>;

    async fn download_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>, MailProviderError>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeMailProvider {
        pub current: Mutex<u64>,
        pub events: Mutex<Vec<(u64, HistoryEvent)>>,
        pub messages: Mutex<HashMap<String, RawMessage>>,
        pub attachments: Mutex<HashMap<(String, String), Vec<u8>>>,
        pub gone: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailProvider for FakeMailProvider {
        async fn current_history_id(&self) -> Result<u64, MailProviderError> {
            Ok(*self.current.lock().unwrap())
        }

        async fn history_delta(&self, since: u64) -> Result<(Vec<HistoryEvent>, u64), MailProviderError> {
            let events = self.events.lock().unwrap();
            let relevant: Vec<HistoryEvent> =
                events.iter().filter(|(id, _)| *id > since).map(|(_, e)| e.clone()).collect();
            let max_id = events.iter().map(|(id, _)| *id).max().unwrap_or(since).max(since);
            Ok((relevant, max_id))
        }

        async fn fetch_message(&self, message_id: &str) -> Result<RawMessage, MailProviderError> {
            if self.gone.lock().unwrap().contains(&message_id.to_string()) {
                return Err(MailProviderError::MessageGone(message_id.to_string()));
            }
            self.messages
                .lock()
                .unwrap()
                .get(message_id)
                .cloned()
                .ok_or_else(|| MailProviderError::MessageGone(message_id.to_string()))
        }

        async fn download_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>, MailProviderError> {
            self.attachments
                .lock()
                .unwrap()
                .get(&(message_id.to_string(), attachment_id.to_string()))
                .cloned()
                .ok_or_else(|| MailProviderError::Unavailable("attachment missing".into()))
        }
    }
}
