//! Component D: property-graph store adapter. Parameterized Cypher with
//! read/write separation and connection-retry (§4.V, §5, §7).
//!
//! No Neo4j driver exists elsewhere in this dependency stack; `neo4rs`
//! is the idiomatic async Rust client for the Bolt protocol and is
//! introduced fresh for this adapter (see DESIGN.md).

use std::collections::BTreeMap;
use std::time::Duration;

use neo4rs::{BoltType, Graph, Query};
use refund_error::{Classify, ErrorCode};
use refund_retry::{retry_async, RetryConfig};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum GraphStoreError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),
    #[error("cypher query failed: {0}")]
    QueryFailed(String),
}

impl Classify for GraphStoreError {
    fn code(&self) -> ErrorCode {
        match self {
            GraphStoreError::Unavailable(_) => ErrorCode::GraphStoreUnavailable,
            GraphStoreError::QueryFailed(_) => ErrorCode::SqlValidationFailed,
        }
    }
}

fn is_transient(err: &GraphStoreError) -> bool {
    matches!(err, GraphStoreError::Unavailable(_))
}

/// A single row from a Cypher result, as loosely-typed JSON values —
/// good enough for the adjudicator's traversal and the builder's verify
/// queries, both of which consume results as data, not as typed structs.
pub type GraphRow = BTreeMap<String, Value>;

pub struct GraphStore {
    graph: Graph,
}

#[derive(Debug, Default, Clone)]
pub struct WriteSummary {
    pub nodes_created: u32,
    pub relationships_created: u32,
}

impl GraphStore {
    /// §4.V: connection test with retry, up to 10s per step and up to 3
    /// steps, to ride out cold starts of a managed graph store.
    pub async fn connect_with_retry(uri: &str, user: &str, password: &str) -> Result<Self, GraphStoreError> {
        let config = RetryConfig::graph_connect_default();
        let uri = uri.to_string();
        let user = user.to_string();
        let password = password.to_string();

        let outcome = retry_async(
            &config,
            || {
                let uri = uri.clone();
                let user = user.clone();
                let password = password.clone();
                async move {
                    Graph::new(&uri, &user, &password)
                        .await
                        .map_err(|e| GraphStoreError::Unavailable(e.to_string()))
                }
            },
            is_transient,
        )
        .await?;

        Ok(GraphStore { graph: outcome.value })
    }

    pub fn from_graph(graph: Graph) -> Self {
        GraphStore { graph }
    }

    /// Executes a read-only Cypher statement and collects every row.
    pub async fn execute_read(&self, cypher: &str, params: Vec<(&str, BoltType)>) -> Result<Vec<GraphRow>, GraphStoreError> {
        let mut query = Query::new(cypher.to_string());
        for (key, value) in params {
            query = query.param(key, value);
        }

        let mut stream = self
            .graph
            .execute(query)
            .await
            .map_err(|e| GraphStoreError::QueryFailed(e.to_string()))?;

        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(|e| GraphStoreError::QueryFailed(e.to_string()))? {
            rows.push(row_to_map(&row));
        }
        Ok(rows)
    }

    /// Executes a single write statement, returning counters for the
    /// builder's per-statement accounting (§4.V).
    pub async fn execute_write(&self, cypher: &str) -> Result<WriteSummary, GraphStoreError> {
        let mut result = self
            .graph
            .execute(Query::new(cypher.to_string()))
            .await
            .map_err(|e| GraphStoreError::QueryFailed(e.to_string()))?;

        // Drain any returned rows so the statement actually completes.
        while result.next().await.map_err(|e| GraphStoreError::QueryFailed(e.to_string()))?.is_some() {}

        // neo4rs doesn't universally expose mutation counters across
        // every statement shape; callers that need exact node/rel counts
        // (the builder) diff verify-query counts before/after instead.
        Ok(WriteSummary::default())
    }

    /// §4.V: deletes relationships then nodes in batches, to avoid a
    /// single unbounded transaction against a large graph.
    pub async fn clear_graph(&self, batch_size: u32) -> Result<(), GraphStoreError> {
        loop {
            let deleted = self
                .delete_batch(&format!(
                    "MATCH ()-[r]->() WITH r LIMIT {batch_size} DELETE r RETURN count(r) AS c"
                ))
                .await?;
            if deleted == 0 {
                break;
            }
        }
        loop {
            let deleted = self
                .delete_batch(&format!("MATCH (n) WITH n LIMIT {batch_size} DETACH DELETE n RETURN count(n) AS c"))
                .await?;
            if deleted == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn delete_batch(&self, cypher: &str) -> Result<i64, GraphStoreError> {
        let rows = self.execute_read(cypher, vec![]).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("c"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    pub async fn create_unique_constraint(&self, label: &str, property: &str) -> Result<(), GraphStoreError> {
        let cypher = format!(
            "CREATE CONSTRAINT IF NOT EXISTS FOR (n:{label}) REQUIRE n.{property} IS UNIQUE"
        );
        self.execute_write(&cypher).await?;
        Ok(())
    }

    pub async fn create_citation_index(&self, label: &str) -> Result<(), GraphStoreError> {
        let cypher = format!("CREATE INDEX IF NOT EXISTS FOR (n:{label}) ON (n.source_citation)");
        self.execute_write(&cypher).await?;
        Ok(())
    }

    /// §4.V verify queries: total node count.
    pub async fn count_nodes(&self) -> Result<i64, GraphStoreError> {
        let rows = self.execute_read("MATCH (n) RETURN count(n) AS c", vec![]).await?;
        Ok(rows.first().and_then(|r| r.get("c")).and_then(Value::as_i64).unwrap_or(0))
    }

    pub async fn count_by_label(&self) -> Result<BTreeMap<String, i64>, GraphStoreError> {
        let rows = self
            .execute_read("MATCH (n) UNWIND labels(n) AS label RETURN label, count(*) AS c", vec![])
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let label = row.get("label")?.as_str()?.to_string();
                let count = row.get("c")?.as_i64()?;
                Some((label, count))
            })
            .collect())
    }

    pub async fn count_by_relationship_type(&self) -> Result<BTreeMap<String, i64>, GraphStoreError> {
        let rows = self
            .execute_read("MATCH ()-[r]->() RETURN type(r) AS rel_type, count(*) AS c", vec![])
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let rel_type = row.get("rel_type")?.as_str()?.to_string();
                let count = row.get("c")?.as_i64()?;
                Some((rel_type, count))
            })
            .collect())
    }

    pub async fn count_nodes_with_citation(&self) -> Result<i64, GraphStoreError> {
        let rows = self
            .execute_read("MATCH (n) WHERE n.source_citation IS NOT NULL RETURN count(n) AS c", vec![])
            .await?;
        Ok(rows.first().and_then(|r| r.get("c")).and_then(Value::as_i64).unwrap_or(0))
    }
}

fn row_to_map(row: &neo4rs::Row) -> GraphRow {
    let mut map = BTreeMap::new();
    for key in row.keys() {
        if let Ok(value) = row.get::<BoltType>(key) {
            map.insert(key.to_string(), bolt_to_json(&value));
        }
    }
    map
}

fn bolt_to_json(value: &BoltType) -> Value {
    match value {
        BoltType::String(s) => Value::String(s.value.clone()),
        BoltType::Boolean(b) => Value::Bool(b.value),
        BoltType::Integer(i) => Value::from(i.value),
        BoltType::Float(f) => serde_json::Number::from_f64(f.value).map(Value::Number).unwrap_or(Value::Null),
        BoltType::Null(_) => Value::Null,
        BoltType::List(list) => Value::Array(list.value.iter().map(bolt_to_json).collect()),
        _ => Value::Null,
    }
}

/// Allows a short delay between pages in the triplet extractor (§5.3)
/// without pulling `tokio::time` into that crate directly.
pub async fn inter_page_delay() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bolt_string_converts_to_json_string() {
        let bolt = BoltType::String(neo4rs::BoltString { value: "Unopened".into() });
        assert_eq!(bolt_to_json(&bolt), Value::String("Unopened".into()));
    }

    #[test]
    fn graph_store_error_categories_match_taxonomy() {
        assert_eq!(GraphStoreError::Unavailable("x".into()).code(), ErrorCode::GraphStoreUnavailable);
        assert_eq!(GraphStoreError::QueryFailed("x".into()).code(), ErrorCode::SqlValidationFailed);
    }
}
