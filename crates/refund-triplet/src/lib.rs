//! Component T: triplet extractor + linker. Splits compiled policy
//! markdown into pages, extracts entities/relationships per page, then
//! dedupes, type-coerces, fuzzy-resolves, and citation-assigns before
//! emitting Cypher (§4.T).

pub mod cypher;
pub mod extraction;
pub mod pages;
pub mod resolve;

use std::collections::HashMap;

use refund_error::{Classify, ErrorCode};
use refund_llm::{LlmClient, LlmError};
use refund_ontology::PolicySchema;

pub use extraction::{PageExtraction, RawEntity, RawRelationship};
pub use pages::Page;
pub use resolve::{ResolvedEntity, ResolvedRelationship};

#[derive(Debug, thiserror::Error)]
pub enum TripletError {
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl Classify for TripletError {
    fn code(&self) -> ErrorCode {
        match self {
            TripletError::Llm(e) => e.code(),
        }
    }
}

pub struct ExtractionResult {
    pub entities: Vec<ResolvedEntity>,
    pub relationships: Vec<ResolvedRelationship>,
    pub cypher_statements: Vec<String>,
    pub dropped_relationship_warnings: Vec<String>,
    pub categories_found: Vec<String>,
    pub relationship_types_used: Vec<String>,
}

/// Runs the full §4.T pipeline against already-compiled policy markdown
/// and the ontology designer's schema.
pub async fn extract_and_link(
    llm: &LlmClient,
    model: &str,
    schema: &PolicySchema,
    combined_markdown: &str,
) -> Result<ExtractionResult, TripletError> {
    let schema_summary = summarize_schema(schema);
    let page_list = pages::split_pages(combined_markdown);

    // Pages are processed sequentially with a short inter-page delay,
    // per §5's provider-RPM guidance for this stage.
    let mut raw_entities: Vec<(RawEntity, Page)> = Vec::new();
    let mut raw_relationships: Vec<RawRelationship> = Vec::new();

    for page in &page_list {
        let extraction = extraction::extract_page(llm, model, &schema_summary, &page.text).await?;
        for entity in extraction.entities {
            raw_entities.push((entity, page.clone()));
        }
        raw_relationships.extend(extraction.relationships);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    let deduped = resolve::dedupe_entities(raw_entities.iter().map(|(e, p)| (e.clone(), p)).collect());

    let lines: Vec<&str> = combined_markdown.lines().collect();
    let default_citation = page_list
        .first()
        .map(|p| format!("{}:page{}:line0", p.filename, p.page))
        .unwrap_or_else(|| "unknown:page1:line0".to_string());

    let mut known_names_by_label: HashMap<String, Vec<String>> = HashMap::new();
    let mut resolved_entities = Vec::new();

    for (mut entity, _page) in deduped {
        resolve::coerce_types(schema, &entity.label, &mut entity.properties);
        let name = entity.properties.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let citation = resolve::assign_citation(&entity.text_excerpt, &lines, &default_citation);

        known_names_by_label.entry(entity.label.clone()).or_default().push(name.clone());
        resolved_entities.push(ResolvedEntity {
            label: entity.label,
            name,
            properties: entity.properties,
            source_citation: citation,
        });
    }

    let (resolved_relationships, warnings) = resolve::resolve_relationships(&raw_relationships, &known_names_by_label);

    let mut cypher_statements: Vec<String> = resolved_entities.iter().map(cypher::emit_entity_merge).collect();
    cypher_statements.extend(resolved_relationships.iter().map(cypher::emit_relationship_merge));

    let categories_found: Vec<String> = resolved_entities
        .iter()
        .filter(|e| e.label == "ProductCategory")
        .map(|e| e.name.clone())
        .collect();
    let mut relationship_types_used: Vec<String> =
        resolved_relationships.iter().map(|r| r.rel_type.clone()).collect();
    relationship_types_used.sort();
    relationship_types_used.dedup();

    Ok(ExtractionResult {
        entities: resolved_entities,
        relationships: resolved_relationships,
        cypher_statements,
        dropped_relationship_warnings: warnings,
        categories_found,
        relationship_types_used,
    })
}

fn summarize_schema(schema: &PolicySchema) -> String {
    let node_summary: Vec<String> = schema
        .nodes
        .iter()
        .map(|n| format!("- {}: {}", n.label, n.properties.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")))
        .collect();
    let rel_summary: Vec<String> = schema
        .relationships
        .iter()
        .map(|r| format!("- ({})-[:{}]->({})", r.from_label, r.rel_type, r.to_label))
        .collect();

    format!("Node Types:\n{}\n\nRelationships:\n{}", node_summary.join("\n"), rel_summary.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use refund_ontology::{NodeSpec, PropertySpec, RelationshipSpec};

    #[test]
    fn schema_summary_lists_nodes_and_relationships() {
        let schema = PolicySchema {
            nodes: vec![NodeSpec {
                label: "ProductCategory".into(),
                description: "d".into(),
                properties: vec![PropertySpec { name: "name".into(), property_type: "string".into(), required: true, description: None }],
                constraints: vec![],
            }],
            relationships: vec![RelationshipSpec {
                rel_type: "HAS_RETURN_RULE".into(),
                from_label: "ProductCategory".into(),
                to_label: "ReturnRule".into(),
                description: "d".into(),
                cardinality: None,
            }],
            design_rationale: String::new(),
        };
        let summary = summarize_schema(&schema);
        assert!(summary.contains("ProductCategory"));
        assert!(summary.contains("HAS_RETURN_RULE"));
    }
}
