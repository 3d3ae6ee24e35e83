//! Component L: the case-worker orchestrator. Runs the per-case
//! pipeline end to end, emitting a typed progress event on an
//! in-process channel at each step boundary (§4.L).

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tracing::warn;
use uuid::Uuid;

use refund_adjudicator::{Adjudicator, AdjudicatorError, PolicyDocSource};
use refund_blob_store::{BlobStore, BlobStoreError};
use refund_core::{
    Attachment, CaseEnvelope, PipelineEvent, RefundCase, VerificationStatus,
};
use refund_error::{Classify, ErrorCode};
use refund_graph_store::GraphStore;
use refund_llm::LlmClient;
use refund_orders_db::{OrdersDb, OrdersDbError};
use refund_verification::{VerificationError, VerificationLoop, VerifiedMatch};
use refund_vision_tool::VisionToolHandler;

#[derive(Debug, thiserror::Error)]
pub enum CaseWorkerError {
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Db(#[from] OrdersDbError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Adjudication(#[from] AdjudicatorError),
    #[error("case envelope failed to deserialize: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl Classify for CaseWorkerError {
    fn code(&self) -> ErrorCode {
        match self {
            CaseWorkerError::Blob(e) => e.code(),
            CaseWorkerError::Db(e) => e.code(),
            CaseWorkerError::Verification(e) => e.code(),
            CaseWorkerError::Adjudication(e) => e.code(),
            CaseWorkerError::Deserialize(_) => ErrorCode::ToolResultSchemaViolation,
        }
    }
}

/// Everything one case's run needs. Built once per worker process (the
/// LLM client, DB pool, and graph store are long-lived singletons) and
/// borrowed for the lifetime of a single `process_case` call.
pub struct CaseWorkerContext<'a> {
    pub blob: &'a dyn BlobStore,
    pub db: &'a OrdersDb,
    pub llm: &'a LlmClient,
    pub model: String,
    pub graph: &'a GraphStore,
    pub policy_docs: &'a dyn PolicyDocSource,
    pub available_categories: Vec<String>,
    pub vision: VisionToolHandler,
}

async fn emit(events: &Sender<PipelineEvent>, event: PipelineEvent) {
    // The demo SSE façade may have already disconnected; dropping the
    // event is fine, the pipeline itself never depends on delivery.
    let _ = events.send(event).await;
}

fn attachment_metadata(attachments: &[Attachment]) -> Value {
    Value::Array(
        attachments
            .iter()
            .map(|a| serde_json::json!({ "filename": a.filename, "mime": a.mime }))
            .collect(),
    )
}

/// Builds the invoice/image text blocks for every attachment
/// concurrently (§4.L step 4, §5: "no step-level fan-out except
/// attachment processing, which may be fan-out-joined"), preserving
/// attachment order in the joined output.
async fn build_attachment_blocks(vision: &VisionToolHandler, attachments: &[Attachment]) -> String {
    let futures = attachments.iter().map(|attachment| async move {
        if attachment.is_pdf() {
            match refund_doc_tool::extract_pdf_text(&attachment.bytes) {
                Ok(text) => Some(format!("--- INVOICE {} ---\n{text}", attachment.filename)),
                Err(err) => {
                    warn!(target: "refund.case_worker", filename = %attachment.filename, %err, "pdf parse failed, skipping attachment");
                    None
                }
            }
        } else if attachment.is_image() {
            let (description, _status) = vision.analyze_defect_bytes(&attachment.mime, &attachment.bytes).await;
            Some(format!("--- IMAGE {} ---\n{description}", attachment.filename))
        } else {
            None
        }
    });

    futures::future::join_all(futures)
        .await
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_case(
    envelope: &CaseEnvelope,
    verified: Option<&VerifiedMatch>,
    extracted_invoice_number: Option<String>,
    extracted_order_invoice_id: Option<String>,
    from_name: Option<String>,
    status: VerificationStatus,
    notes: Option<String>,
    metadata: Value,
) -> RefundCase {
    let now = Utc::now();
    RefundCase {
        case_id: Uuid::new_v4(),
        case_source: "gmail".into(),
        source_message_id: envelope.source_message_id.clone(),
        received_at: envelope.message.received_at,
        from_email: envelope.message.from_email.clone(),
        from_name,
        subject: envelope.message.subject.clone(),
        body: envelope.message.body_text.clone(),
        customer_id: verified.map(|v| v.customer.customer_id),
        order_id: verified.map(|v| v.order.order_id),
        extracted_invoice_number,
        extracted_order_invoice_id,
        classification: envelope.classification.category,
        confidence: envelope.classification.confidence,
        verification_status: status,
        verification_notes: notes,
        attachments: attachment_metadata(&envelope.message.attachments),
        metadata,
        created_at: now,
        updated_at: now,
    }
}

/// Runs the full §4.L pipeline for one `{bucket, blob_path}` task,
/// returning the persisted [`RefundCase`] row. Every step boundary is
/// reported on `events` before the corresponding work begins and after
/// it completes; callers that don't need live progress (the HTTP
/// `/process` handler) can drop the receiving end.
pub async fn process_case(
    ctx: &CaseWorkerContext<'_>,
    blob_path: &str,
    events: Sender<PipelineEvent>,
) -> Result<RefundCase, CaseWorkerError> {
    emit(&events, PipelineEvent::active("load_envelope", format!("loading case envelope from {blob_path}"))).await;
    let bytes = ctx.blob.get(blob_path).await?;
    let envelope: CaseEnvelope = serde_json::from_slice(&bytes).map_err(CaseWorkerError::Deserialize)?;
    emit(&events, PipelineEvent::complete("load_envelope", "case envelope loaded", None)).await;

    if !envelope.classification.category.is_actionable() {
        let case = build_case(
            &envelope,
            None,
            None,
            None,
            None,
            VerificationStatus::PendingReview,
            Some("classification was not actionable".to_string()),
            Value::Object(Default::default()),
        );
        ctx.db.upsert_refund_case(&case).await?;
        emit(&events, PipelineEvent::complete("classify", "not actionable, persisted for review", None)).await;
        return Ok(case);
    }

    emit(&events, PipelineEvent::active("build_context", "building combined text context")).await;
    let attachment_blocks = build_attachment_blocks(&ctx.vision, &envelope.message.attachments).await;
    let combined_text = if attachment_blocks.is_empty() {
        format!(
            "From: {}\nSubject: {}\n\n{}",
            envelope.message.from_email, envelope.message.subject, envelope.message.body_text
        )
    } else {
        format!(
            "From: {}\nSubject: {}\n\n{}\n\n{attachment_blocks}",
            envelope.message.from_email, envelope.message.subject, envelope.message.body_text
        )
    };
    emit(&events, PipelineEvent::complete("build_context", "combined text context built", None)).await;

    emit(&events, PipelineEvent::active("extraction", "extracting order intent")).await;
    let intent = refund_extraction::extract_order_intent(ctx.llm, &ctx.model, &combined_text).await;
    emit(
        &events,
        PipelineEvent::complete("extraction", "order intent extracted", serde_json::to_value(&intent).ok()),
    )
    .await;

    emit(&events, PipelineEvent::active("verification", "running verification loop")).await;
    let verification_loop = VerificationLoop::new(ctx.db, ctx.llm, ctx.model.clone());
    let outcome = verification_loop.run(&envelope.message.from_email, &intent).await?;
    for turn in &outcome.turns {
        emit(&events, PipelineEvent::active("verification", turn.detail.clone()).with_substep(turn.step.clone())).await;
    }
    emit(&events, PipelineEvent::complete("verification", "verification loop finished", None)).await;

    let Some(verified) = outcome.verified.as_ref() else {
        let case = build_case(
            &envelope,
            None,
            intent.invoice_number.clone(),
            intent.order_invoice_id.clone(),
            intent.full_name.clone(),
            VerificationStatus::PendingReview,
            outcome.notes.clone(),
            Value::Object(Default::default()),
        );
        ctx.db.upsert_refund_case(&case).await?;
        emit(&events, PipelineEvent::complete("persist", "no verified match, persisted for review", None)).await;
        return Ok(case);
    };

    if outcome.used_any_fuzzy_tool() {
        let case = build_case(
            &envelope,
            Some(verified),
            intent.invoice_number.clone(),
            intent.order_invoice_id.clone(),
            intent.full_name.clone(),
            VerificationStatus::PendingReview,
            Some("fuzzy matching was used; automated decisions require exact-id matches".to_string()),
            Value::Object(Default::default()),
        );
        ctx.db.upsert_refund_case(&case).await?;
        emit(&events, PipelineEvent::complete("persist", "verified via fuzzy match, held for review", None)).await;
        return Ok(case);
    }

    emit(&events, PipelineEvent::active("adjudication", "running adjudicator")).await;
    let adjudicator = Adjudicator::new(ctx.graph, ctx.llm, ctx.model.clone());
    let adjudication = adjudicator
        .adjudicate(&verified.order, &verified.items, &intent, &ctx.available_categories, ctx.policy_docs, Utc::now())
        .await?;
    emit(
        &events,
        PipelineEvent::complete(
            "adjudication",
            "adjudication complete",
            serde_json::to_value(&adjudication.decision).ok(),
        ),
    )
    .await;

    let metadata = serde_json::json!({
        "adjudication_decision": adjudication.decision,
        "customer_explanation": adjudication.customer_explanation,
        "category_used": adjudication.category_used,
    });
    let case = build_case(
        &envelope,
        Some(verified),
        intent.invoice_number.clone(),
        intent.order_invoice_id.clone(),
        intent.full_name.clone(),
        VerificationStatus::Verified,
        None,
        metadata,
    );
    ctx.db.upsert_refund_case(&case).await?;
    emit(&events, PipelineEvent::complete("persist", "refund case persisted", None)).await;

    Ok(case)
}

#[cfg(test)]
mod tests {
    use super::*;
    use refund_core::{Classification, MailCategory, NormalizedMessage};

    fn sample_envelope(category: MailCategory, attachments: Vec<Attachment>) -> CaseEnvelope {
        let message = NormalizedMessage {
            provider_id: "abc123".into(),
            received_at: "2026-01-15T10:30:00Z".parse().unwrap(),
            from_email: "jane@example.com".into(),
            subject: "return request".into(),
            body_text: "please refund order INV-1".into(),
            attachments,
        };
        let classification = Classification { category, confidence: 0.9, explicit_user_id: None };
        CaseEnvelope::new(message, classification)
    }

    #[test]
    fn attachment_metadata_never_includes_bytes() {
        let attachments = vec![Attachment { filename: "receipt.pdf".into(), mime: "application/pdf".into(), bytes: vec![1, 2, 3] }];
        let meta = attachment_metadata(&attachments);
        let entry = meta.as_array().unwrap()[0].as_object().unwrap();
        assert_eq!(entry.get("filename").and_then(Value::as_str), Some("receipt.pdf"));
        assert!(!entry.contains_key("bytes"));
    }

    #[test]
    fn non_actionable_envelope_round_trips_through_serde() {
        let envelope = sample_envelope(MailCategory::None, vec![]);
        let json = serde_json::to_vec(&envelope).unwrap();
        let decoded: CaseEnvelope = serde_json::from_slice(&json).unwrap();
        assert!(!decoded.classification.category.is_actionable());
    }

    #[tokio::test]
    async fn build_attachment_blocks_skips_non_pdf_non_image_and_preserves_order() {
        let vision = VisionToolHandler::new(LlmClient::new("unused"), "gemini-2.5-pro");
        let attachments = vec![Attachment { filename: "notes.txt".into(), mime: "text/plain".into(), bytes: vec![] }];
        let blocks = build_attachment_blocks(&vision, &attachments).await;
        assert!(blocks.is_empty());
    }

    #[test]
    fn build_case_never_sets_customer_or_order_without_a_verified_match() {
        let envelope = sample_envelope(MailCategory::Return, vec![]);
        let case = build_case(
            &envelope,
            None,
            None,
            None,
            None,
            VerificationStatus::PendingReview,
            Some("no match".to_string()),
            Value::Object(Default::default()),
        );
        assert!(case.customer_id.is_none());
        assert!(case.order_id.is_none());
        assert_eq!(case.verification_status, VerificationStatus::PendingReview);
    }
}
