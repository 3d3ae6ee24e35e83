//! HTTP surface (§6): the Gmail push webhook, the case-worker task
//! endpoint, and a synchronous SSE demo endpoint, wired over the same
//! `AppState` the binary in `main.rs` assembles from real adapters.

pub mod categories;
pub mod policy_docs;
pub mod pubsub;
pub mod token;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use refund_blob_store::fake::InMemoryBlobStore;
use refund_blob_store::{BlobStore, GcsBlobStore};
use refund_core::{CaseEnvelope, PipelineEvent};
use refund_cursor_store::PostgresCursorStore;
use refund_error::Classify;
use refund_graph_store::GraphStore;
use refund_llm::LlmClient;
use refund_mail_ingress::{GmailProvider, HttpTaskQueue, IngressHandler};
use refund_orders_db::OrdersDb;
use refund_vision_tool::VisionToolHandler;

use policy_docs::BlobPolicyDocSource;
use pubsub::PushEnvelope;
use token::RefreshingBearerToken;

pub type DaemonBlobStore = GcsBlobStore<RefreshingBearerToken>;
pub type DaemonIngressHandler = IngressHandler<GmailProvider, PostgresCursorStore, DaemonBlobStore, HttpTaskQueue>;

/// Every long-lived adapter the daemon needs, built once in `main` and
/// shared across requests. `blob` is a second handle onto the same GCS
/// configuration the ingress handler owns, not a separate store — see
/// `GcsBlobStore`'s `Clone` impl.
pub struct AppState {
    pub ingress: DaemonIngressHandler,
    pub blob: DaemonBlobStore,
    pub db: OrdersDb,
    pub graph: GraphStore,
    pub llm: LlmClient,
    pub model: String,
    pub vision: VisionToolHandler,
    pub available_categories: Vec<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError { status, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/pubsub/gmail", post(pubsub_gmail))
        .route("/process", post(process_task))
        .route("/process-demo", post(process_demo))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// §6: 204 if there was no message to act on, 200 on success, 500 to
/// force Pub/Sub to redeliver.
async fn pubsub_gmail(State(state): State<Arc<AppState>>, Json(envelope): Json<PushEnvelope>) -> Response {
    let decoded = match pubsub::decode_history_notification(&envelope) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(target: "refund.daemon", %err, "pubsub envelope failed to decode");
            return (StatusCode::OK, Json(json!({ "status": "ignored", "reason": err }))).into_response();
        }
    };

    let Some(_history_id) = decoded else {
        return StatusCode::NO_CONTENT.into_response();
    };

    match state.ingress.handle_notification().await {
        Ok(outcome) => {
            info!(
                target: "refund.daemon",
                messages_seen = outcome.messages_seen,
                messages_enqueued = outcome.messages_enqueued,
                "gmail ingress pass complete"
            );
            (StatusCode::OK, Json(json!({ "status": "ok", "messages_enqueued": outcome.messages_enqueued }))).into_response()
        }
        Err(err) => {
            error!(target: "refund.daemon", %err, category = %err.category(), "gmail ingress pass failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessTaskRequest {
    #[allow(dead_code)]
    bucket: String,
    blob_path: String,
}

#[derive(Debug, Serialize)]
struct ProcessTaskResponse {
    case_id: uuid::Uuid,
}

/// §6: 200 on success, 500 to trigger the task queue's retry.
async fn process_task(State(state): State<Arc<AppState>>, Json(req): Json<ProcessTaskRequest>) -> Response {
    let (tx, mut rx) = mpsc::channel::<PipelineEvent>(32);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let policy_docs = BlobPolicyDocSource::new(&state.blob);
    let ctx = refund_case_worker::CaseWorkerContext {
        blob: &state.blob,
        db: &state.db,
        llm: &state.llm,
        model: state.model.clone(),
        graph: &state.graph,
        policy_docs: &policy_docs,
        available_categories: state.available_categories.clone(),
        vision: VisionToolHandler::new(state.llm.clone(), state.model.clone()),
    };

    match refund_case_worker::process_case(&ctx, &req.blob_path, tx).await {
        Ok(case) => {
            info!(target: "refund.daemon", case_id = %case.case_id, "case processed");
            (StatusCode::OK, Json(ProcessTaskResponse { case_id: case.case_id })).into_response()
        }
        Err(err) => {
            error!(target: "refund.daemon", %err, category = %err.category(), blob_path = %req.blob_path, "case processing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// §6: runs a case synchronously against an in-process blob store,
/// streaming every `PipelineEvent` as SSE until a terminal event.
async fn process_demo(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<CaseEnvelope>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let (tx, rx) = mpsc::channel::<PipelineEvent>(32);

    let demo_blob = InMemoryBlobStore::default();
    let blob_path = envelope.message.blob_key();
    let bytes = serde_json::to_vec(&envelope).expect("envelope serializes");

    // Moving the whole `Arc<AppState>` into the task lets the worker
    // context borrow `state.db`/`state.graph`/`state.blob` directly
    // without requiring those adapters to be `Clone`.
    tokio::spawn(async move {
        if let Err(err) = demo_blob.put(&blob_path, bytes).await {
            let _ = tx.send(PipelineEvent::error("load_envelope", format!("failed to stage demo envelope: {err}"))).await;
            return;
        }

        let policy_docs = BlobPolicyDocSource::new(&state.blob);
        let vision = VisionToolHandler::new(state.llm.clone(), state.model.clone());
        let ctx = refund_case_worker::CaseWorkerContext {
            blob: &demo_blob,
            db: &state.db,
            llm: &state.llm,
            model: state.model.clone(),
            graph: &state.graph,
            policy_docs: &policy_docs,
            available_categories: state.available_categories.clone(),
            vision,
        };

        let events_tx = tx.clone();
        match refund_case_worker::process_case(&ctx, &blob_path, tx).await {
            Ok(_) => {}
            Err(err) => {
                let _ = events_tx.send(PipelineEvent::error("process_case", err.to_string())).await;
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().event(format!("{:?}", event.status)).data(data))
    });

    Sse::new(stream)
}
