//! Component V: the graph builder. Connects with retry, optionally
//! clears the target graph, derives constraints/indexes from the
//! ontology schema, loads Cypher statements one-by-one, then verifies
//! the result and emits a build log artifact (§4.V).

use chrono::{DateTime, Utc};
use refund_error::{Classify, ErrorCode};
use refund_graph_store::GraphStore;
use refund_ontology::PolicySchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

const CLEAR_BATCH_SIZE: u32 = 10_000;
const MAX_RECORDED_ERRORS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] refund_graph_store::GraphStoreError),
}

impl Classify for BuildError {
    fn code(&self) -> ErrorCode {
        match self {
            BuildError::Graph(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySummary {
    pub total_nodes: i64,
    pub counts_by_label: BTreeMap<String, i64>,
    pub counts_by_relationship_type: BTreeMap<String, i64>,
    pub nodes_with_citation: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLog {
    pub status: BuildStatus,
    pub statements_attempted: usize,
    pub statements_succeeded: usize,
    pub statements_failed: usize,
    pub first_errors: Vec<String>,
    pub constraints_created: Vec<String>,
    pub indexes_created: Vec<String>,
    pub verify: VerifySummary,
    pub built_at: DateTime<Utc>,
}

/// Parses `UNIQUE(property)` constraint strings from a node spec's
/// `constraints` list. Anything not matching that shape is ignored;
/// the ontology designer is only asked to emit this one form.
fn parse_unique_constraint(constraint: &str) -> Option<String> {
    let trimmed = constraint.trim();
    let inner = trimmed.strip_prefix("UNIQUE(")?.strip_suffix(')')?;
    Some(inner.trim().to_string())
}

/// Loads the schema's constraints/indexes and the triplet extractor's
/// Cypher statements into the graph, optionally clearing it first, then
/// verifies the result and returns a build log.
pub async fn build_graph(
    store: &GraphStore,
    schema: &PolicySchema,
    cypher_statements: &[String],
    clear_first: bool,
    built_at: DateTime<Utc>,
) -> Result<BuildLog, BuildError> {
    if clear_first {
        info!(target: "refund.graph_builder", "clearing existing graph before load");
        store.clear_graph(CLEAR_BATCH_SIZE).await?;
    }

    let mut constraints_created = Vec::new();
    let mut indexes_created = Vec::new();

    for node in &schema.nodes {
        for constraint in &node.constraints {
            if let Some(property) = parse_unique_constraint(constraint) {
                store.create_unique_constraint(&node.label, &property).await?;
                constraints_created.push(format!("{}.{}", node.label, property));
            }
        }
        store.create_citation_index(&node.label).await?;
        indexes_created.push(format!("{}.source_citation", node.label));
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut first_errors = Vec::new();

    for statement in cypher_statements {
        match store.execute_write(statement).await {
            Ok(_) => succeeded += 1,
            Err(err) => {
                failed += 1;
                warn!(target: "refund.graph_builder", statement, %err, "statement failed");
                if first_errors.len() < MAX_RECORDED_ERRORS {
                    first_errors.push(format!("{statement}: {err}"));
                }
            }
        }
    }

    let total_nodes = store.count_nodes().await?;
    let counts_by_label = store.count_by_label().await?;
    let counts_by_relationship_type = store.count_by_relationship_type().await?;
    let nodes_with_citation = store.count_nodes_with_citation().await?;

    let status = if failed == 0 && total_nodes > 0 {
        BuildStatus::Success
    } else if succeeded > 0 && total_nodes > 0 {
        BuildStatus::PartialSuccess
    } else {
        BuildStatus::Failed
    };

    Ok(BuildLog {
        status,
        statements_attempted: cypher_statements.len(),
        statements_succeeded: succeeded,
        statements_failed: failed,
        first_errors,
        constraints_created,
        indexes_created,
        verify: VerifySummary { total_nodes, counts_by_label, counts_by_relationship_type, nodes_with_citation },
        built_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unique_constraint() {
        assert_eq!(parse_unique_constraint("UNIQUE(name)"), Some("name".to_string()));
        assert_eq!(parse_unique_constraint("NOT_UNIQUE"), None);
    }

    #[test]
    fn parses_unique_constraint_with_surrounding_whitespace() {
        assert_eq!(parse_unique_constraint("  UNIQUE( sku ) "), Some("sku".to_string()));
    }

    #[test]
    fn status_logic_matches_thresholds() {
        fn status(failed: usize, succeeded: usize, total_nodes: i64) -> BuildStatus {
            if failed == 0 && total_nodes > 0 {
                BuildStatus::Success
            } else if succeeded > 0 && total_nodes > 0 {
                BuildStatus::PartialSuccess
            } else {
                BuildStatus::Failed
            }
        }
        assert_eq!(status(0, 5, 10), BuildStatus::Success);
        assert_eq!(status(2, 3, 10), BuildStatus::PartialSuccess);
        assert_eq!(status(5, 0, 0), BuildStatus::Failed);
    }
}
