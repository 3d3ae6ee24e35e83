//! The offline policy-compiler pipeline: R (ingest) -> S (design) -> T
//! (extract) -> U (critique, up to 2 revision retries re-running T with
//! the same schema) -> V (build), per the compiler's sequencing rule.
//! Produces one results artifact capturing every stage's outcome.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use refund_blob_store::{policy_paths, BlobStore, BlobStoreError};
use refund_critic::CriticVerdict;
use refund_graph_builder::BuildLog;
use refund_graph_store::GraphStore;
use refund_llm::LlmClient;
use refund_ontology::PolicySchema;

const MAX_REVISION_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Ingest(#[from] refund_policy_ingest::IngestError),
    #[error(transparent)]
    Ontology(#[from] refund_ontology::OntologyError),
    #[error(transparent)]
    Triplet(#[from] refund_triplet::TripletError),
    #[error(transparent)]
    Critic(#[from] refund_critic::CriticError),
    #[error(transparent)]
    Build(#[from] refund_graph_builder::BuildError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
}

/// Per-attempt record of a T -> U round, kept so the artifact shows why
/// a revision was retried rather than only the final verdict.
#[derive(Debug, Serialize)]
pub struct ExtractionAttempt {
    pub attempt: u32,
    pub entities_found: usize,
    pub relationships_found: usize,
    pub dropped_relationship_warnings: usize,
    pub verdict: CriticVerdict,
}

#[derive(Debug, Serialize)]
pub struct CompileReport {
    pub files_processed: usize,
    pub total_pages: usize,
    pub schema: PolicySchema,
    pub attempts: Vec<ExtractionAttempt>,
    pub final_attempt_accepted: bool,
    pub build_log: BuildLog,
    pub compiled_at: DateTime<Utc>,
}

pub struct CompileModels<'a> {
    pub ontology: &'a str,
    pub extraction: &'a str,
    pub critic: &'a str,
}

/// Runs the full compiler pipeline, loads the result into `store`, and
/// publishes the ingested markdown and page index to `blobs` so the
/// daemon's citation resolver can serve them at adjudication time.
pub async fn run(
    llm: &LlmClient,
    models: CompileModels<'_>,
    store: &GraphStore,
    blobs: &dyn BlobStore,
    pdf_directory: &Path,
    clear_first: bool,
) -> Result<CompileReport, CompileError> {
    let ingestion = refund_policy_ingest::parse_documents(llm, models.ontology, pdf_directory).await?;
    tracing::info!(
        target: "refund.cli",
        files = ingestion.files_processed,
        pages = ingestion.total_pages,
        "policy documents ingested"
    );

    blobs.put(policy_paths::COMBINED_MARKDOWN, ingestion.combined_markdown.clone().into_bytes()).await?;
    blobs.put(policy_paths::PAGE_INDEX, serde_json::to_vec(&ingestion.page_index).map_err(|e| {
        BlobStoreError::Unavailable(format!("page index encode: {e}"))
    })?).await?;
    tracing::info!(target: "refund.cli", "published compiled policy artifacts to blob store");

    let schema = refund_ontology::design_ontology(llm, models.ontology, &ingestion.combined_markdown).await?;
    tracing::info!(target: "refund.cli", nodes = schema.nodes.len(), relationships = schema.relationships.len(), "ontology designed");

    let mut attempts = Vec::new();
    let mut accepted_extraction = None;

    for attempt in 1..=(MAX_REVISION_RETRIES + 1) {
        let extraction =
            refund_triplet::extract_and_link(llm, models.extraction, &schema, &ingestion.combined_markdown).await?;

        let verdict = refund_critic::validate_artifacts(
            llm,
            models.critic,
            &schema,
            &extraction.cypher_statements,
            &extraction.dropped_relationship_warnings,
            extraction.entities.len(),
            extraction.relationships.len(),
        )
        .await?;

        let approved = matches!(verdict.validation_status, refund_critic::ValidationStatus::Approved);
        tracing::info!(
            target: "refund.cli",
            attempt,
            approved,
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            "extraction attempt critiqued"
        );

        attempts.push(ExtractionAttempt {
            attempt,
            entities_found: extraction.entities.len(),
            relationships_found: extraction.relationships.len(),
            dropped_relationship_warnings: extraction.dropped_relationship_warnings.len(),
            verdict,
        });

        if approved {
            accepted_extraction = Some(extraction);
            break;
        }
        if attempt <= MAX_REVISION_RETRIES {
            continue;
        }
        // Exhausted retries: build from the last attempt anyway so a
        // partial graph and its critic findings both make it into the
        // artifact for a human to review.
        accepted_extraction = Some(extraction);
    }

    let final_attempt_accepted = attempts.last().map(|a| matches!(a.verdict.validation_status, refund_critic::ValidationStatus::Approved)).unwrap_or(false);
    let extraction = accepted_extraction.expect("loop always assigns a final attempt");

    let build_log = refund_graph_builder::build_graph(store, &schema, &extraction.cypher_statements, clear_first, Utc::now()).await?;
    tracing::info!(target: "refund.cli", status = ?build_log.status, "graph build complete");

    Ok(CompileReport {
        files_processed: ingestion.files_processed,
        total_pages: ingestion.total_pages,
        schema,
        attempts,
        final_attempt_accepted,
        build_log,
        compiled_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    #[test]
    fn max_revision_retries_allows_three_total_attempts() {
        assert_eq!(super::MAX_REVISION_RETRIES, 2);
    }
}
