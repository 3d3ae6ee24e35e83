//! The real Gmail REST adapter for [`MailProvider`]. Refreshes its
//! OAuth access token from the stored refresh token, then drives the
//! `users.history`, `users.messages.get`, and
//! `users.messages.attachments.get` endpoints the same way the original
//! `gmail_processor.py` did (§4.H, §6 "Mail: OAuth token in a secret").

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::mime::{MimePart, RawMessage};
use crate::provider::{HistoryEvent, MailProvider, MailProviderError};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// The refresh-token credential bundle stored in the mail secret (§6).
/// Field names mirror the original `load_gmail_token()` dict so the
/// same secret payload can be read unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct GmailCredentials {
    pub refresh_token: String,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
}

struct CachedToken {
    access_token: String,
    expires_at: std::time::Instant,
}

pub struct GmailProvider {
    http: reqwest::Client,
    credentials: GmailCredentials,
    cached_token: Mutex<Option<CachedToken>>,
}

impl GmailProvider {
    pub fn new(credentials: GmailCredentials) -> Self {
        GmailProvider { http: reqwest::Client::new(), credentials, cached_token: Mutex::new(None) }
    }

    async fn access_token(&self) -> Result<String, MailProviderError> {
        {
            let guard = self.cached_token.lock().unwrap();
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > std::time::Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let resp = self
            .http
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &self.credentials.refresh_token),
                ("client_id", &self.credentials.client_id),
                ("client_secret", &self.credentials.client_secret),
            ])
            .send()
            .await
            .map_err(|e| MailProviderError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(MailProviderError::Unavailable(format!("token refresh failed: status {}", resp.status())));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }
        let token: TokenResponse =
            resp.json().await.map_err(|e| MailProviderError::Unavailable(format!("token response decode: {e}")))?;

        let expires_at = std::time::Instant::now() + std::time::Duration::from_secs(token.expires_in.saturating_sub(30));
        *self.cached_token.lock().unwrap() = Some(CachedToken { access_token: token.access_token.clone(), expires_at });
        Ok(token.access_token)
    }

    async fn get_json(&self, url: &str) -> Result<Value, MailProviderError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| MailProviderError::Unavailable(e.to_string()))?;

        if resp.status().as_u16() == 404 {
            return Err(MailProviderError::MessageGone(url.to_string()));
        }
        if !resp.status().is_success() {
            return Err(MailProviderError::Unavailable(format!("gmail api status {}", resp.status())));
        }
        resp.json().await.map_err(|e| MailProviderError::Unavailable(format!("gmail response decode: {e}")))
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn current_history_id(&self) -> Result<u64, MailProviderError> {
        let profile = self.get_json(&format!("{GMAIL_API_BASE}/profile")).await?;
        profile
            .get("historyId")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| MailProviderError::Unavailable("profile response missing historyId".into()))
    }

    async fn history_delta(&self, since: u64) -> Result<(Vec<HistoryEvent>, u64), MailProviderError> {
        let url = format!("{GMAIL_API_BASE}/history?startHistoryId={since}&historyTypes=messageAdded");
        let body = self.get_json(&url).await?;

        let mut events = Vec::new();
        let mut max_id = since;

        for entry in body.get("history").and_then(Value::as_array).into_iter().flatten() {
            if let Some(id) = entry.get("id").and_then(Value::as_str).and_then(|s| s.parse::<u64>().ok()) {
                max_id = max_id.max(id);
            }
            for added in entry.get("messagesAdded").and_then(Value::as_array).into_iter().flatten() {
                if let Some(message_id) = added.get("message").and_then(|m| m.get("id")).and_then(Value::as_str) {
                    events.push(HistoryEvent { message_id: message_id.to_string() });
                }
            }
        }

        Ok((events, max_id))
    }

    async fn fetch_message(&self, message_id: &str) -> Result<RawMessage, MailProviderError> {
        let url = format!("{GMAIL_API_BASE}/messages/{message_id}?format=full");
        let body = self.get_json(&url).await?;

        let headers: BTreeMap<String, String> = body
            .get("payload")
            .and_then(|p| p.get("headers"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|h| {
                let name = h.get("name")?.as_str()?.to_string();
                let value = h.get("value")?.as_str()?.to_string();
                Some((name, value))
            })
            .collect();

        let payload = body
            .get("payload")
            .map(parse_mime_part)
            .ok_or_else(|| MailProviderError::Unavailable("message missing payload".into()))?;

        let internal_date_epoch_millis =
            body.get("internalDate").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(RawMessage { provider_id: message_id.to_string(), headers, payload, internal_date_epoch_millis })
    }

    async fn download_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>, MailProviderError> {
        let url = format!("{GMAIL_API_BASE}/messages/{message_id}/attachments/{attachment_id}");
        let body = self.get_json(&url).await?;
        let data = body
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| MailProviderError::Unavailable("attachment response missing data".into()))?;
        decode_base64url(data).map_err(MailProviderError::Unavailable)
    }
}

fn parse_mime_part(payload: &Value) -> MimePart {
    let content_type = payload.get("mimeType").and_then(Value::as_str).unwrap_or_default().to_string();
    let filename = payload.get("filename").and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string);
    let body = payload.get("body");
    let attachment_id = body.and_then(|b| b.get("attachmentId")).and_then(Value::as_str).map(str::to_string);
    let inline_text = body
        .and_then(|b| b.get("data"))
        .and_then(Value::as_str)
        .and_then(|data| decode_base64url(data).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

    let parts = payload
        .get("parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(parse_mime_part)
        .collect();

    MimePart { content_type, filename, attachment_id, inline_text, parts }
}

/// Gmail's API uses the URL-safe base64 alphabet (`-`/`_` instead of
/// `+`/`/`) and frequently omits padding.
fn decode_base64url(input: &str) -> Result<Vec<u8>, String> {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'-' => Some(62),
            b'_' => Some(63),
            _ => None,
        }
    }
    let cleaned: Vec<u8> = input.bytes().filter(|b| *b != b'\n' && *b != b'\r' && *b != b'=').collect();
    let mut out = Vec::with_capacity(cleaned.len() * 3 / 4);
    for chunk in cleaned.chunks(4) {
        let vals: Vec<u8> =
            chunk.iter().map(|b| value(*b).ok_or_else(|| format!("invalid base64url byte {b}"))).collect::<Result<_, _>>()?;
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
            1 => return Err("truncated base64url input".into()),
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_base64url_handles_dash_and_underscore() {
        // "hi?" encoded with the url-safe alphabet, unpadded.
        let decoded = decode_base64url("aGk_").unwrap();
        assert_eq!(decoded, b"hi?");
    }

    #[test]
    fn parse_mime_part_extracts_plain_text_body() {
        let payload = serde_json::json!({
            "mimeType": "text/plain",
            "body": { "data": "aGVsbG8" }
        });
        let part = parse_mime_part(&payload);
        assert_eq!(part.content_type, "text/plain");
        assert_eq!(part.inline_text.as_deref(), Some("hello"));
    }

    #[test]
    fn parse_mime_part_recurses_into_nested_parts() {
        let payload = serde_json::json!({
            "mimeType": "multipart/mixed",
            "body": {},
            "parts": [
                { "mimeType": "text/plain", "body": { "data": "aGVsbG8" } },
                { "mimeType": "application/pdf", "filename": "receipt.pdf", "body": { "attachmentId": "att1" } },
            ],
        });
        let part = parse_mime_part(&payload);
        assert_eq!(part.parts.len(), 2);
        assert_eq!(part.parts[1].filename.as_deref(), Some("receipt.pdf"));
        assert_eq!(part.parts[1].attachment_id.as_deref(), Some("att1"));
    }
}
