//! Component B: blob store adapter. Put/get opaque byte objects under a
//! path (§6: `gs://<bucket>/<safe_from>/<safe_from>_<ts>.json`).

use async_trait::async_trait;
use refund_error::{Classify, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl Classify for BlobStoreError {
    fn code(&self) -> ErrorCode {
        match self {
            BlobStoreError::Unavailable(_) => ErrorCode::ToolUnreachable,
            BlobStoreError::NotFound(_) => ErrorCode::OrderNotFound,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobStoreError>;
}

/// Supplies a fresh bearer token for GCS calls. Token acquisition itself
/// (workload identity, service-account key) is an external collaborator
/// this crate doesn't implement.
pub trait BearerTokenSource: Send + Sync {
    fn token(&self) -> String;
}

/// A token fetched once and reused for the lifetime of the source. Fine
/// for short-lived processes (the policy-compiler CLI); the daemon
/// should refresh on a schedule instead, since a compute-metadata
/// access token is only valid for about an hour.
#[derive(Clone)]
pub struct StaticBearerToken(pub String);

impl BearerTokenSource for StaticBearerToken {
    fn token(&self) -> String {
        self.0.clone()
    }
}

/// Fetches a GCS-scoped access token from the GCE/Cloud Run metadata
/// server, the same host dispatcher.rs's identity-token fetch in
/// `refund-mail-ingress` talks to, for the default service account.
pub async fn fetch_metadata_server_access_token(client: &reqwest::Client) -> Result<String, BlobStoreError> {
    #[derive(serde::Deserialize)]
    struct TokenResponse {
        access_token: String,
    }

    let resp = client
        .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| BlobStoreError::Unavailable(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(BlobStoreError::Unavailable(format!("metadata token fetch status {}", resp.status())));
    }

    let token: TokenResponse =
        resp.json().await.map_err(|e| BlobStoreError::Unavailable(format!("metadata token decode: {e}")))?;
    Ok(token.access_token)
}

/// Talks to the GCS JSON API directly over `reqwest`; no GCS SDK exists
/// in this workspace's dependency stack, so this is a thin, deliberately
/// narrow wrapper around the two calls this pipeline actually needs.
#[derive(Clone)]
pub struct GcsBlobStore<T: BearerTokenSource> {
    client: reqwest::Client,
    bucket: String,
    tokens: T,
}

impl<T: BearerTokenSource> GcsBlobStore<T> {
    pub fn new(bucket: impl Into<String>, tokens: T) -> Self {
        GcsBlobStore {
            client: reqwest::Client::new(),
            bucket: bucket.into(),
            tokens,
        }
    }
}

#[async_trait]
impl<T: BearerTokenSource> BlobStore for GcsBlobStore<T> {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        let url = format!(
            "https://storage.googleapis.com/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            urlencoding_minimal(path),
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.tokens.token())
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(|e| BlobStoreError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BlobStoreError::Unavailable(format!(
                "gcs put returned {}",
                resp.status()
            )))
        }
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
        let url = format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{}?alt=media",
            self.bucket,
            urlencoding_minimal(path),
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.tokens.token())
            .send()
            .await
            .map_err(|e| BlobStoreError::Unavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobStoreError::NotFound(path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BlobStoreError::Unavailable(format!("gcs get returned {}", resp.status())));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| BlobStoreError::Unavailable(e.to_string()))
    }
}

/// Percent-encodes the path segments GCS object names actually contain
/// here (`/`, `_`, alnum, `.`); not a general-purpose URL encoder.
fn urlencoding_minimal(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' => "%2F".to_string(),
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') => c.to_string(),
            c => format!("%{:02X}", c as u32),
        })
        .collect()
}

/// Object-path conventions for the compiled policy artifacts the CLI
/// writes and the daemon's `PolicyDocSource` reads back. Kept here since
/// both sides already depend on this crate for the store itself.
///
/// The page index's `start_line`/`end_line` are offsets into one
/// combined document spanning every source PDF, not per-file offsets,
/// so there is a single markdown blob rather than one per filename; a
/// `PolicyDocSource` backed by this layout serves the same combined
/// document regardless of which filename is requested.
pub mod policy_paths {
    pub const PAGE_INDEX: &str = "policy/page_index.json";
    pub const COMBINED_MARKDOWN: &str = "policy/combined_markdown.md";
}

/// In-memory store used by tests and the `/process-demo` path.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryBlobStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl BlobStore for InMemoryBlobStore {
        async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
            self.objects.lock().await.insert(path.to_string(), bytes);
            Ok(())
        }

        async fn get(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
            self.objects
                .lock()
                .await
                .get(path)
                .cloned()
                .ok_or_else(|| BlobStoreError::NotFound(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryBlobStore;
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryBlobStore::default();
        store.put("a/b.json", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("a/b.json").await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = InMemoryBlobStore::default();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[test]
    fn url_encoding_escapes_slash() {
        assert_eq!(urlencoding_minimal("a/b_c.json"), "a%2Fb_c.json");
    }
}
