//! Component U: the critic. Runs fast local checks against the ontology
//! schema and the emitted Cypher, then asks the model for a holistic
//! pass/fail judgement over a bounded sample of the artifacts (§4.U).

use refund_error::{Classify, ErrorCode};
use refund_llm::{LlmClient, LlmError, ReasoningEffort};
use refund_ontology::PolicySchema;
use refund_retry::{retry_async, RetryConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const MAX_CYPHER_STATEMENTS_REVIEWED: usize = 50;
const ORPHANED_RELATIONSHIP_ERROR_THRESHOLD: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum CriticError {
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl Classify for CriticError {
    fn code(&self) -> ErrorCode {
        match self {
            CriticError::Llm(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Approved,
    NeedsRevision,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchemaIssue {
    pub issue: String,
    pub severity: Severity,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CypherIssue {
    pub issue: String,
    pub statement_index: Option<usize>,
    pub severity: Severity,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoverageIssue {
    pub missing: String,
    pub recommendation: Option<String>,
}

/// Local, non-LLM checks, run before (and always alongside) the model
/// call: schema nodes missing `source_citation`, literal `==` in
/// Cypher, `MERGE` statements missing a citation, and an escalation
/// based on how many relationships the triplet stage had to drop.
#[derive(Debug, Default)]
pub struct LocalValidation {
    pub schema_issues: Vec<SchemaIssue>,
    pub cypher_issues: Vec<CypherIssue>,
}

impl LocalValidation {
    pub fn error_count(&self) -> usize {
        self.schema_issues.iter().filter(|i| i.severity == Severity::Error).count()
            + self.cypher_issues.iter().filter(|i| i.severity == Severity::Error).count()
    }
}

pub fn perform_local_validation(
    schema: &PolicySchema,
    cypher_statements: &[String],
    dropped_relationship_warnings: &[String],
) -> LocalValidation {
    let mut result = LocalValidation::default();

    for node in &schema.nodes {
        let has_citation = node.properties.iter().any(|p| p.name == "source_citation");
        if !has_citation {
            result.schema_issues.push(SchemaIssue {
                issue: format!("node '{}' has no source_citation property", node.label),
                severity: Severity::Error,
                fix: Some("add a required source_citation string property".to_string()),
            });
        }
    }

    for (idx, statement) in cypher_statements.iter().enumerate() {
        if statement.contains("==") {
            result.cypher_issues.push(CypherIssue {
                issue: format!("statement {idx} uses '==' instead of '='"),
                statement_index: Some(idx),
                severity: Severity::Error,
                fix: Some("replace '==' with '='".to_string()),
            });
        }
        if statement.trim_start().starts_with("MERGE") && !statement.to_lowercase().contains("source_citation") {
            result.cypher_issues.push(CypherIssue {
                issue: format!("statement {idx} creates a node without a source_citation property"),
                statement_index: Some(idx),
                severity: Severity::Warning,
                fix: Some("include source_citation in the MERGE property map".to_string()),
            });
        }
    }

    let dropped = dropped_relationship_warnings.len();
    if dropped > ORPHANED_RELATIONSHIP_ERROR_THRESHOLD {
        result.cypher_issues.push(CypherIssue {
            issue: format!("{dropped} relationships were dropped for unresolved endpoints"),
            statement_index: None,
            severity: Severity::Error,
            fix: Some("review entity naming consistency across pages".to_string()),
        });
    } else if dropped > 0 {
        result.cypher_issues.push(CypherIssue {
            issue: format!("{dropped} relationships were dropped for unresolved endpoints"),
            statement_index: None,
            severity: Severity::Warning,
            fix: None,
        });
    }

    result
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CriticVerdict {
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub schema_issues: Vec<SchemaIssue>,
    #[serde(default)]
    pub cypher_issues: Vec<CypherIssue>,
    #[serde(default)]
    pub coverage_issues: Vec<CoverageIssue>,
    pub summary: String,
    pub confidence_score: f64,
}

const CRITIC_SYSTEM_PROMPT: &str = "You are reviewing a knowledge graph compiled from a retail return policy \
document before it is loaded into production. Check four things: (1) schema validation - does every node type \
make sense for return-policy rules, and does every node carry a source_citation property; (2) cypher validation - \
are the MERGE/MATCH statements syntactically sound and do they cite their source; (3) coverage validation - does \
the extraction look like it captured the policy's return windows, fees, restrictions, and conditions, or does it \
look thin for the amount of source material; (4) source citation check - flag anything that looks fabricated or \
uncited. Respond with validation_status of 'approved' or 'needs_revision'. Be thorough but practical: minor \
warnings should not block approval.";

/// Runs the full critic pass: local checks first, folded into the
/// verdict regardless of what the model says, then (unless local
/// checks alone already carry enough error-severity issues to make the
/// call obvious) a single LLM pass over a bounded sample of the
/// artifacts.
pub async fn validate_artifacts(
    llm: &LlmClient,
    model: &str,
    schema: &PolicySchema,
    cypher_statements: &[String],
    dropped_relationship_warnings: &[String],
    entity_count: usize,
    relationship_count: usize,
) -> Result<CriticVerdict, CriticError> {
    let local = perform_local_validation(schema, cypher_statements, dropped_relationship_warnings);

    if local.error_count() > 3 {
        return Ok(CriticVerdict {
            validation_status: ValidationStatus::NeedsRevision,
            schema_issues: local.schema_issues,
            cypher_issues: local.cypher_issues,
            coverage_issues: Vec::new(),
            summary: "local validation found more than 3 error-severity issues; skipping model review".to_string(),
            confidence_score: 0.3,
        });
    }

    let schema_json = serde_json::to_string_pretty(schema).unwrap_or_default();
    let sampled: Vec<&String> = cypher_statements.iter().take(MAX_CYPHER_STATEMENTS_REVIEWED).collect();
    let cypher_sample = sampled.iter().enumerate().map(|(i, s)| format!("{i}: {s}")).collect::<Vec<_>>().join("\n");

    let prompt = format!(
        "SCHEMA:\n{schema_json}\n\nCYPHER STATEMENTS (first {} of {}):\n{cypher_sample}\n\n\
         EXTRACTION SUMMARY: {entity_count} entities, {relationship_count} relationships, \
         {} relationships dropped for unresolved endpoints.\n\n\
         LOCAL VALIDATION ALREADY FOUND:\n{}\n\n\
         Produce a validation_status, schema_issues, cypher_issues, coverage_issues, summary, and confidence_score.",
        sampled.len(),
        cypher_statements.len(),
        dropped_relationship_warnings.len(),
        local.schema_issues.iter().map(|i| i.issue.clone()).chain(local.cypher_issues.iter().map(|i| i.issue.clone())).collect::<Vec<_>>().join("; "),
    );

    let reasoning = ReasoningEffort::for_model(model, ReasoningEffort::High);
    let config = RetryConfig::critic_default();
    let outcome = retry_async(
        &config,
        || async { llm.generate_structured::<CriticVerdict>(model, CRITIC_SYSTEM_PROMPT, &prompt, reasoning).await },
        is_transient,
    )
    .await?;

    let mut verdict = outcome.value;
    for issue in local.schema_issues {
        if !verdict.schema_issues.iter().any(|i| i.issue == issue.issue) {
            verdict.schema_issues.push(issue);
        }
    }
    for issue in local.cypher_issues {
        if !verdict.cypher_issues.iter().any(|i| i.issue == issue.issue) {
            verdict.cypher_issues.push(issue);
        }
    }
    if verdict.schema_issues.iter().any(|i| i.severity == Severity::Error)
        || verdict.cypher_issues.iter().any(|i| i.severity == Severity::Error)
    {
        verdict.validation_status = ValidationStatus::NeedsRevision;
    }

    Ok(verdict)
}

fn is_transient(err: &LlmError) -> bool {
    matches!(err, LlmError::Timeout | LlmError::RateLimited | LlmError::ConnectionReset(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use refund_ontology::{NodeSpec, PropertySpec};

    fn schema_missing_citation() -> PolicySchema {
        PolicySchema {
            nodes: vec![NodeSpec {
                label: "ReturnRule".into(),
                description: "d".into(),
                properties: vec![PropertySpec { name: "name".into(), property_type: "string".into(), required: true, description: None }],
                constraints: vec![],
            }],
            relationships: vec![],
            design_rationale: String::new(),
        }
    }

    #[test]
    fn flags_node_missing_source_citation() {
        let schema = schema_missing_citation();
        let result = perform_local_validation(&schema, &[], &[]);
        assert_eq!(result.schema_issues.len(), 1);
        assert_eq!(result.schema_issues[0].severity, Severity::Error);
    }

    #[test]
    fn flags_double_equals_in_cypher() {
        let schema = schema_missing_citation();
        let statements = vec!["MATCH (n) WHERE n.x == 1 RETURN n".to_string()];
        let result = perform_local_validation(&schema, &statements, &[]);
        assert!(result.cypher_issues.iter().any(|i| i.issue.contains("==") && i.severity == Severity::Error));
    }

    #[test]
    fn flags_merge_missing_citation_as_warning() {
        let schema = schema_missing_citation();
        let statements = vec!["MERGE (n:ReturnRule {name: \"Standard\"})".to_string()];
        let result = perform_local_validation(&schema, &statements, &[]);
        assert!(result
            .cypher_issues
            .iter()
            .any(|i| i.issue.contains("without a source_citation") && i.severity == Severity::Warning));
    }

    #[test]
    fn does_not_flag_merge_with_citation() {
        let schema = schema_missing_citation();
        let statements = vec!["MERGE (n:ReturnRule {name: \"Standard\", source_citation: \"f.pdf:page1:line1\"})".to_string()];
        let result = perform_local_validation(&schema, &statements, &[]);
        assert!(result.cypher_issues.is_empty());
    }

    #[test]
    fn many_dropped_relationships_escalate_to_error() {
        let schema = schema_missing_citation();
        let warnings: Vec<String> = (0..11).map(|i| format!("dropped {i}")).collect();
        let result = perform_local_validation(&schema, &[], &warnings);
        assert!(result.cypher_issues.iter().any(|i| i.severity == Severity::Error && i.issue.contains("dropped")));
    }

    #[test]
    fn few_dropped_relationships_are_only_a_warning() {
        let schema = schema_missing_citation();
        let warnings: Vec<String> = (0..3).map(|i| format!("dropped {i}")).collect();
        let result = perform_local_validation(&schema, &[], &warnings);
        assert!(result.cypher_issues.iter().any(|i| i.severity == Severity::Warning && i.issue.contains("dropped")));
        assert!(!result.cypher_issues.iter().any(|i| i.severity == Severity::Error && i.issue.contains("dropped")));
    }

    #[test]
    fn error_count_combines_schema_and_cypher_errors() {
        let local = LocalValidation {
            schema_issues: vec![SchemaIssue { issue: "a".into(), severity: Severity::Error, fix: None }],
            cypher_issues: vec![
                CypherIssue { issue: "b".into(), statement_index: None, severity: Severity::Error, fix: None },
                CypherIssue { issue: "c".into(), statement_index: None, severity: Severity::Warning, fix: None },
            ],
        };
        assert_eq!(local.error_count(), 2);
    }
}
