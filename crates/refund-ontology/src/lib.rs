//! Component S: the ontology designer. One `reasoning=high` LLM call
//! turns compiled policy markdown into a graph schema proposal, then
//! the two structural post-conditions (§4.S) are enforced in code
//! rather than trusted to the model.

use refund_error::{Classify, ErrorCode};
use refund_llm::{LlmClient, LlmError, ReasoningEffort};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, thiserror::Error)]
pub enum OntologyError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("relationship '{rel_type}' references undefined {which} node '{label}'")]
    UndefinedNodeLabel { rel_type: String, which: &'static str, label: String },
}

impl Classify for OntologyError {
    fn code(&self) -> ErrorCode {
        match self {
            OntologyError::Llm(e) => e.code(),
            OntologyError::UndefinedNodeLabel { .. } => ErrorCode::LlmSchemaViolation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PropertySpec {
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeSpec {
    pub label: String,
    pub description: String,
    pub properties: Vec<PropertySpec>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RelationshipSpec {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub from_label: String,
    pub to_label: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicySchema {
    pub nodes: Vec<NodeSpec>,
    pub relationships: Vec<RelationshipSpec>,
    pub design_rationale: String,
}

const ONTOLOGY_SYSTEM_PROMPT: &str = "You are a Neo4j schema designer for retail return-policy documents.\n\
Critical rules:\n\
1. Every node must have a 'name' property (string, required) in addition to 'source_citation'.\n\
2. Use PascalCase for node labels (e.g. ReturnRule), UPPER_SNAKE_CASE for relationship types \
   (e.g. HAS_RETURN_RULE).\n\
3. Model conditional logic with explicit condition nodes linked via REQUIRES or EXCLUDES relationships.\n\
4. Include constraint types where appropriate (UNIQUE, NOT NULL).\n\
5. Every relationship's from_label and to_label must exactly match a label defined in nodes: no spelling \
   variations or plurals.\n\
Do not create nodes for generic concepts: Policy, Document, Company, Website, Customer, Section, Page.";

/// Designs a graph schema from compiled policy markdown (§4.S). Enforces
/// the two structural post-conditions the original implementation also
/// enforced in code rather than leaving to the model: every node gets a
/// `source_citation` property, and every relationship's labels resolve.
pub async fn design_ontology(llm: &LlmClient, model: &str, policy_markdown: &str) -> Result<PolicySchema, OntologyError> {
    let prompt = format!(
        "Analyze this retail return-policy document and design a comprehensive Neo4j knowledge graph schema.\n\n\
         POLICY DOCUMENT:\n{policy_markdown}\n\n\
         Focus on capturing: product categories, return rules with time windows, membership-tier overrides, \
         restocking fees, non-returnable items, and special conditions (opened, defective, etc).\n\n\
         Remember: every node type must include a source_citation property.",
    );

    let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::High);
    let mut schema = llm.generate_structured::<PolicySchema>(model, ONTOLOGY_SYSTEM_PROMPT, &prompt, reasoning).await?;

    ensure_source_citation_property(&mut schema);
    validate_relationship_labels(&schema)?;

    Ok(schema)
}

fn ensure_source_citation_property(schema: &mut PolicySchema) {
    for node in &mut schema.nodes {
        let has_citation = node.properties.iter().any(|p| p.name == "source_citation");
        if !has_citation {
            node.properties.push(PropertySpec {
                name: "source_citation".to_string(),
                property_type: "string".to_string(),
                required: true,
                description: Some("Reference to the source section in the policy document".to_string()),
            });
        }
    }
}

fn validate_relationship_labels(schema: &PolicySchema) -> Result<(), OntologyError> {
    let labels: HashSet<&str> = schema.nodes.iter().map(|n| n.label.as_str()).collect();
    for rel in &schema.relationships {
        if !labels.contains(rel.from_label.as_str()) {
            return Err(OntologyError::UndefinedNodeLabel {
                rel_type: rel.rel_type.clone(),
                which: "source",
                label: rel.from_label.clone(),
            });
        }
        if !labels.contains(rel.to_label.as_str()) {
            return Err(OntologyError::UndefinedNodeLabel {
                rel_type: rel.rel_type.clone(),
                which: "target",
                label: rel.to_label.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(label: &str, with_citation: bool) -> NodeSpec {
        let mut properties = vec![PropertySpec { name: "name".into(), property_type: "string".into(), required: true, description: None }];
        if with_citation {
            properties.push(PropertySpec { name: "source_citation".into(), property_type: "string".into(), required: true, description: None });
        }
        NodeSpec { label: label.to_string(), description: "d".into(), properties, constraints: vec![] }
    }

    #[test]
    fn adds_missing_source_citation_property() {
        let mut schema = PolicySchema { nodes: vec![node("ProductCategory", false)], relationships: vec![], design_rationale: String::new() };
        ensure_source_citation_property(&mut schema);
        assert!(schema.nodes[0].properties.iter().any(|p| p.name == "source_citation"));
    }

    #[test]
    fn leaves_existing_source_citation_property_alone() {
        let mut schema = PolicySchema { nodes: vec![node("ProductCategory", true)], relationships: vec![], design_rationale: String::new() };
        ensure_source_citation_property(&mut schema);
        assert_eq!(schema.nodes[0].properties.iter().filter(|p| p.name == "source_citation").count(), 1);
    }

    #[test]
    fn rejects_relationship_with_undefined_target_label() {
        let schema = PolicySchema {
            nodes: vec![node("ProductCategory", true)],
            relationships: vec![RelationshipSpec {
                rel_type: "HAS_RETURN_RULE".into(),
                from_label: "ProductCategory".into(),
                to_label: "ReturnRule".into(),
                description: "d".into(),
                cardinality: None,
            }],
            design_rationale: String::new(),
        };
        let err = validate_relationship_labels(&schema).unwrap_err();
        assert!(matches!(err, OntologyError::UndefinedNodeLabel { which: "target", .. }));
    }

    #[test]
    fn accepts_relationship_with_known_labels() {
        let schema = PolicySchema {
            nodes: vec![node("ProductCategory", true), node("ReturnRule", true)],
            relationships: vec![RelationshipSpec {
                rel_type: "HAS_RETURN_RULE".into(),
                from_label: "ProductCategory".into(),
                to_label: "ReturnRule".into(),
                description: "d".into(),
                cardinality: None,
            }],
            design_rationale: String::new(),
        };
        assert!(validate_relationship_labels(&schema).is_ok());
    }
}
