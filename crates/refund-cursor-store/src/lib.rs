//! Component A: durable cursor store (§3.1, §3.6 invariant 2).
//!
//! A single non-negative integer — the last Gmail history id fully
//! processed — read and written transactionally so the cursor never
//! moves backwards even under concurrent ingress handlers (§5.1).

use async_trait::async_trait;
use refund_error::{Classify, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum CursorStoreError {
    #[error("cursor store unavailable: {0}")]
    Unavailable(String),
    #[error("cursor store returned an unexpected row shape: {0}")]
    Corrupt(String),
}

impl Classify for CursorStoreError {
    fn code(&self) -> ErrorCode {
        match self {
            CursorStoreError::Unavailable(_) => ErrorCode::OrdersDbUnavailable,
            CursorStoreError::Corrupt(_) => ErrorCode::SqlValidationFailed,
        }
    }
}

/// A single named checkpoint, e.g. `"gmail"`.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<Option<u64>, CursorStoreError>;

    /// Conditional update: only advances the stored value if `value` is
    /// strictly greater than what's there (or nothing is there yet).
    /// Returns the value that ended up stored.
    async fn advance_to(&self, name: &str, value: u64) -> Result<u64, CursorStoreError>;
}

/// Postgres-backed cursor store: one row per named cursor, advanced with
/// `GREATEST()` inside the same statement so concurrent writers never
/// race each other into a regression.
pub struct PostgresCursorStore {
    pool: sqlx::PgPool,
}

impl PostgresCursorStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        PostgresCursorStore { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), CursorStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history_cursors (
                name TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CursorStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for PostgresCursorStore {
    async fn read(&self, name: &str) -> Result<Option<u64>, CursorStoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM history_cursors WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CursorStoreError::Unavailable(e.to_string()))?;
        match row {
            Some((v,)) if v >= 0 => Ok(Some(v as u64)),
            Some((v,)) => Err(CursorStoreError::Corrupt(format!("negative cursor value {v}"))),
            None => Ok(None),
        }
    }

    async fn advance_to(&self, name: &str, value: u64) -> Result<u64, CursorStoreError> {
        let value = i64::try_from(value).map_err(|_| CursorStoreError::Corrupt("cursor overflowed i64".into()))?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO history_cursors (name, value) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = GREATEST(history_cursors.value, EXCLUDED.value)
            RETURNING value
            "#,
        )
        .bind(name)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CursorStoreError::Unavailable(e.to_string()))?;
        Ok(row.0 as u64)
    }
}

/// In-memory store used by tests and the `/process-demo` path where no
/// durable cursor is wanted.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryCursorStore {
        values: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl CursorStore for InMemoryCursorStore {
        async fn read(&self, name: &str) -> Result<Option<u64>, CursorStoreError> {
            Ok(self.values.lock().await.get(name).copied())
        }

        async fn advance_to(&self, name: &str, value: u64) -> Result<u64, CursorStoreError> {
            let mut guard = self.values.lock().await;
            let entry = guard.entry(name.to_string()).or_insert(0);
            *entry = (*entry).max(value);
            Ok(*entry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryCursorStore;
    use super::*;

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let store = InMemoryCursorStore::default();
        assert_eq!(store.advance_to("gmail", 10).await.unwrap(), 10);
        assert_eq!(store.advance_to("gmail", 5).await.unwrap(), 10);
        assert_eq!(store.advance_to("gmail", 20).await.unwrap(), 20);
        assert_eq!(store.read("gmail").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn unknown_cursor_reads_as_none() {
        let store = InMemoryCursorStore::default();
        assert_eq!(store.read("gmail").await.unwrap(), None);
    }
}
