//! Components H (mail-event normalizer), I (classifier), J (case
//! record — largely `refund_core::CaseEnvelope`), and K (task
//! dispatcher).

pub mod classifier;
pub mod dispatcher;
pub mod gmail;
pub mod handler;
pub mod mime;
pub mod provider;

pub use classifier::classify;
pub use dispatcher::{HttpTaskQueue, TaskPayload, TaskQueue, TaskQueueError};
pub use gmail::{GmailCredentials, GmailProvider};
pub use handler::{IngressError, IngressHandler, IngressOutcome};
pub use mime::{normalize_message, MimePart, RawMessage};
pub use provider::{HistoryEvent, MailProvider, MailProviderError};
