//! Long-running counterpart to the CLI's one-shot
//! [`refund_blob_store::StaticBearerToken`]: refreshes the cached GCS
//! access token on a background interval rather than once at startup,
//! since the daemon's process outlives any single token's ~1h lifetime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use refund_blob_store::{fetch_metadata_server_access_token, BearerTokenSource};
use tracing::warn;

const REFRESH_INTERVAL: Duration = Duration::from_secs(45 * 60);

#[derive(Clone)]
pub struct RefreshingBearerToken {
    current: Arc<Mutex<String>>,
}

impl RefreshingBearerToken {
    /// Fetches an initial token, then spawns a background task that
    /// refreshes it every [`REFRESH_INTERVAL`]. A failed refresh just
    /// logs and keeps serving the last good token; the next tick tries
    /// again.
    pub async fn start(client: reqwest::Client) -> Result<Self, refund_blob_store::BlobStoreError> {
        let initial = fetch_metadata_server_access_token(&client).await?;
        let current = Arc::new(Mutex::new(initial));

        let background = current.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                match fetch_metadata_server_access_token(&client).await {
                    Ok(token) => *background.lock().unwrap() = token,
                    Err(err) => warn!(target: "refund.daemon", %err, "blob store token refresh failed, keeping previous token"),
                }
            }
        });

        Ok(RefreshingBearerToken { current })
    }
}

impl BearerTokenSource for RefreshingBearerToken {
    fn token(&self) -> String {
        self.current.lock().unwrap().clone()
    }
}
