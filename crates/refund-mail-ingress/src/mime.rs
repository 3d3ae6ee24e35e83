//! §4.H.2: recursive MIME-tree normalization. Prefers `text/plain`;
//! `text/html` parts are stripped to text while preserving paragraph
//! breaks; attachments are carried as (filename, mime, bytes).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use refund_core::{Attachment, NormalizedMessage};

use crate::provider::{MailProvider, MailProviderError};

#[derive(Debug, Clone)]
pub struct MimePart {
    pub content_type: String,
    pub filename: Option<String>,
    pub attachment_id: Option<String>,
    pub inline_text: Option<String>,
    pub parts: Vec<MimePart>,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub provider_id: String,
    pub headers: BTreeMap<String, String>,
    pub payload: MimePart,
    pub internal_date_epoch_millis: i64,
}

impl RawMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Strips HTML tags to plain text, preserving paragraph breaks by
/// inserting a blank line wherever a block-level tag closes.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag_buf = String::new();

    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                tag_buf.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let tag_lower = tag_buf.to_ascii_lowercase();
                if tag_lower.starts_with("/p") || tag_lower.starts_with("br") || tag_lower.starts_with("/div") {
                    out.push('\n');
                }
            }
            _ if in_tag => tag_buf.push(c),
            _ => out.push(c),
        }
    }

    // Collapse runs of 3+ newlines down to a single paragraph break.
    let mut collapsed = String::with_capacity(out.len());
    let mut newline_run = 0;
    for c in out.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                collapsed.push(c);
            }
        } else {
            newline_run = 0;
            collapsed.push(c);
        }
    }
    html_entity_decode(collapsed.trim())
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Recursively walks the MIME tree, concatenating body text parts and
/// downloading attachment bytes, per §4.H.2.b-c.
pub async fn normalize_message(
    message: &RawMessage,
    provider: &dyn MailProvider,
) -> Result<NormalizedMessage, MailProviderError> {
    let mut plain_parts = Vec::new();
    let mut html_parts = Vec::new();
    let mut attachments = Vec::new();

    collect_parts(&message.provider_id, &message.payload, provider, &mut plain_parts, &mut html_parts, &mut attachments).await?;

    let body_text = if !plain_parts.is_empty() {
        plain_parts.join("\n\n")
    } else {
        html_parts.iter().map(|h| strip_html(h)).collect::<Vec<_>>().join("\n\n")
    };

    let from_email = message
        .header("From")
        .and_then(extract_email_address)
        .unwrap_or_default()
        .to_lowercase();

    let subject = message.header("Subject").unwrap_or_default().to_string();

    let received_at = DateTime::<Utc>::from_timestamp_millis(message.internal_date_epoch_millis).unwrap_or_else(Utc::now);

    Ok(NormalizedMessage {
        provider_id: message.provider_id.clone(),
        received_at,
        from_email,
        subject,
        body_text,
        attachments,
    })
}

fn collect_parts<'a>(
    message_id: &'a str,
    part: &'a MimePart,
    provider: &'a dyn MailProvider,
    plain: &'a mut Vec<String>,
    html: &'a mut Vec<String>,
    attachments: &'a mut Vec<Attachment>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), MailProviderError>> + 'a>> {
    Box::pin(async move {
        if let (Some(filename), Some(attachment_id)) = (&part.filename, &part.attachment_id) {
            let bytes = provider.download_attachment(message_id, attachment_id).await?;
            attachments.push(Attachment {
                filename: filename.clone(),
                mime: part.content_type.clone(),
                bytes,
            });
        } else if part.content_type == "text/plain" {
            if let Some(text) = &part.inline_text {
                plain.push(text.clone());
            }
        } else if part.content_type == "text/html" {
            if let Some(text) = &part.inline_text {
                html.push(text.clone());
            }
        }

        for child in &part.parts {
            collect_parts(message_id, child, provider, plain, html, attachments).await?;
        }
        Ok(())
    })
}

/// RFC 5322 `From:` headers are often `"Display Name" <addr@host>`;
/// this extracts just the address, lowercased by the caller.
fn extract_email_address(header_value: &str) -> Option<&str> {
    if let Some(start) = header_value.find('<') {
        let end = header_value[start..].find('>')? + start;
        Some(header_value[start + 1..end].trim())
    } else {
        Some(header_value.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_preserves_paragraph_breaks() {
        let html = "<p>Hello there.</p><p>Second paragraph.</p>";
        let text = strip_html(html);
        assert_eq!(text, "Hello there.\n\nSecond paragraph.");
    }

    #[test]
    fn strip_html_decodes_entities() {
        assert_eq!(strip_html("Tom &amp; Jerry"), "Tom & Jerry");
    }

    #[test]
    fn extract_email_address_handles_display_name() {
        assert_eq!(extract_email_address("\"Jane Doe\" <jane@example.com>"), Some("jane@example.com"));
        assert_eq!(extract_email_address("jane@example.com"), Some("jane@example.com"));
    }
}
