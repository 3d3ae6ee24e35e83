//! §4.Q.3 the two-hop policy graph walk: hop one pulls everything a
//! `Category` node connects to directly, grouped by relationship type
//! into the five buckets the reasoning prompt expects; hop two expands
//! one step further from whatever hop one returned, for enrichment
//! detail (e.g. a `Fee` node's own conditions).

use std::collections::BTreeMap;

use neo4rs::BoltType;
use refund_graph_store::{GraphRow, GraphStore, GraphStoreError};
use serde_json::Value;

#[derive(Debug, Default, Clone)]
pub struct PolicyTraversal {
    pub windows: Vec<Value>,
    pub fees: Vec<Value>,
    pub restrictions: Vec<Value>,
    pub required_conditions: Vec<Value>,
    pub excluded_methods: Vec<Value>,
    pub enrichment: Vec<Value>,
    pub source_citations: Vec<String>,
}

fn bucket_for_relationship(rel_type: &str) -> Option<fn(&mut PolicyTraversal) -> &mut Vec<Value>> {
    match rel_type {
        "HAS_RETURN_WINDOW" | "HAS_WINDOW" => Some(|t| &mut t.windows),
        "HAS_FEE" | "CHARGES_FEE" => Some(|t| &mut t.fees),
        "HAS_RESTRICTION" | "RESTRICTED_BY" => Some(|t| &mut t.restrictions),
        "REQUIRES_CONDITION" | "REQUIRES" => Some(|t| &mut t.required_conditions),
        "EXCLUDES_METHOD" | "EXCLUDES" => Some(|t| &mut t.excluded_methods),
        _ => None,
    }
}

/// Runs the bounded traversal for one category, returning the grouped
/// result the reasoning call consumes.
pub async fn traverse(store: &GraphStore, category: &str) -> Result<PolicyTraversal, GraphStoreError> {
    let mut traversal = PolicyTraversal::default();

    let hop1 = store
        .execute_read(
            "MATCH (c:Category {name: $category})-[r]->(n) RETURN type(r) AS rel_type, n AS node",
            vec![("category", BoltType::from(category.to_string()))],
        )
        .await?;

    let mut hop1_node_ids = Vec::new();
    for row in &hop1 {
        let Some(rel_type) = row.get("rel_type").and_then(Value::as_str) else { continue };
        let Some(node) = row.get("node") else { continue };
        collect_citation(node, &mut traversal.source_citations);
        if let Some(bucket_fn) = bucket_for_relationship(rel_type) {
            bucket_fn(&mut traversal).push(node.clone());
        }
        if let Some(name) = node.get("name").and_then(Value::as_str) {
            hop1_node_ids.push(name.to_string());
        }
    }

    for node_name in hop1_node_ids.iter().take(20) {
        let hop2 = store
            .execute_read(
                "MATCH (n {name: $name})-[r2]->(m) RETURN type(r2) AS rel_type, m AS node",
                vec![("name", BoltType::from(node_name.clone()))],
            )
            .await?;
        for row in hop2 {
            if let Some(node) = row.get("node") {
                collect_citation(node, &mut traversal.source_citations);
                traversal.enrichment.push(node.clone());
            }
        }
    }

    traversal.source_citations.sort();
    traversal.source_citations.dedup();
    Ok(traversal)
}

fn collect_citation(node: &Value, citations: &mut Vec<String>) {
    if let Some(citation) = node.get("source_citation").and_then(Value::as_str) {
        citations.push(citation.to_string());
    }
}

/// Summarizes row counts for logging, without dumping full node bodies.
pub fn traversal_counts(rows: &[GraphRow]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    counts.insert("rows", rows.len());
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_relationship_names_to_buckets() {
        assert!(bucket_for_relationship("HAS_FEE").is_some());
        assert!(bucket_for_relationship("REQUIRES_CONDITION").is_some());
        assert!(bucket_for_relationship("SOMETHING_ELSE").is_none());
    }

    #[test]
    fn collects_citation_when_present() {
        let mut citations = Vec::new();
        let node = serde_json::json!({ "name": "30-day window", "source_citation": "policy.pdf:page1:line3" });
        collect_citation(&node, &mut citations);
        assert_eq!(citations, vec!["policy.pdf:page1:line3".to_string()]);
    }

    #[test]
    fn missing_citation_is_skipped() {
        let mut citations = Vec::new();
        let node = serde_json::json!({ "name": "no citation here" });
        collect_citation(&node, &mut citations);
        assert!(citations.is_empty());
    }
}
