//! §3.1 mail-pipeline entities: the records produced before a case ever
//! reaches the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three categories the classifier will actually enqueue, plus the
/// sentinel for "nothing to do here".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum MailCategory {
    Return,
    Replacement,
    Refund,
    None,
}

impl MailCategory {
    /// Whether this category is one of the three that get enqueued for
    /// case-worker processing.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, MailCategory::None)
    }
}

/// Single LLM-schema classification result for a normalized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Classification {
    pub category: MailCategory,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_user_id: Option<String>,
}

impl Classification {
    /// Policy knob for auto-accept display; does not gate enqueueing.
    pub const AUTO_ACCEPT_THRESHOLD: f64 = 0.75;

    pub fn is_high_confidence(&self) -> bool {
        self.confidence >= Self::AUTO_ACCEPT_THRESHOLD
    }
}

/// A MIME attachment with its raw bytes. Never logged, never placed in a
/// DB column other than the blob store's opaque payload.
#[derive(Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("mime", &self.mime)
            .field("bytes_len", &self.bytes.len())
            .finish()
    }
}

impl Attachment {
    pub fn is_pdf(&self) -> bool {
        self.mime == "application/pdf"
            || self.filename.to_ascii_lowercase().ends_with(".pdf")
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

/// A message normalized out of the mail provider's MIME tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub provider_id: String,
    pub received_at: DateTime<Utc>,
    pub from_email: String,
    pub subject: String,
    pub body_text: String,
    pub attachments: Vec<Attachment>,
}

impl NormalizedMessage {
    /// `safe_from` per §4.2 / §6: `@` and `.` replaced so the string is a
    /// safe path segment.
    pub fn safe_from(&self) -> String {
        self.from_email.replace('@', "_at_").replace('.', "_")
    }

    /// Stable id derived from the upstream provider id, so replays of the
    /// same notification produce the same case.
    pub fn source_message_id(&self) -> String {
        format!("gmail:{}", self.provider_id)
    }

    pub fn blob_key(&self) -> String {
        let safe = self.safe_from();
        let ts = self.received_at.format("%Y%m%dT%H%M%SZ");
        format!("{safe}/{safe}_{ts}.json")
    }

    /// First 4000 chars of the body, the slice the classifier is allowed
    /// to see per §4.I.
    pub fn classifier_excerpt(&self) -> &str {
        let max = 4000;
        match self.body_text.char_indices().nth(max) {
            Some((byte_idx, _)) => &self.body_text[..byte_idx],
            None => &self.body_text,
        }
    }
}

/// The envelope written to blob storage: a normalized message plus its
/// classification and the ingestion-generated stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEnvelope {
    pub message: NormalizedMessage,
    pub classification: Classification,
    pub source_message_id: String,
}

impl CaseEnvelope {
    pub fn new(message: NormalizedMessage, classification: Classification) -> Self {
        let source_message_id = message.source_message_id();
        CaseEnvelope {
            message,
            classification,
            source_message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> NormalizedMessage {
        NormalizedMessage {
            provider_id: "abc123".into(),
            received_at: "2026-01-15T10:30:00Z".parse().unwrap(),
            from_email: "Jane.Doe@Example.com".into(),
            subject: "my order".into(),
            body_text: "hello".into(),
            attachments: vec![],
        }
    }

    #[test]
    fn safe_from_escapes_at_and_dot() {
        assert_eq!(msg().safe_from(), "Jane_Doe_at_Example_com");
    }

    #[test]
    fn blob_key_matches_layout() {
        let key = msg().blob_key();
        assert!(key.starts_with("Jane_Doe_at_Example_com/Jane_Doe_at_Example_com_20260115T103000Z"));
        assert!(key.ends_with(".json"));
    }

    #[test]
    fn source_message_id_is_stable_across_calls() {
        let m = msg();
        assert_eq!(m.source_message_id(), m.source_message_id());
    }

    #[test]
    fn classifier_excerpt_truncates_on_char_boundary() {
        let mut m = msg();
        m.body_text = "x".repeat(5000);
        assert_eq!(m.classifier_excerpt().chars().count(), 4000);
    }

    #[test]
    fn none_category_is_not_actionable() {
        assert!(!MailCategory::None.is_actionable());
        assert!(MailCategory::Return.is_actionable());
    }
}
