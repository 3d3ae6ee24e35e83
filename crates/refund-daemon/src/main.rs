//! Daemon entry point (§6): reads the environment once, builds every
//! real adapter, and serves the HTTP surface until killed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use refund_blob_store::GcsBlobStore;
use refund_config::RuntimeConfig;
use refund_cursor_store::PostgresCursorStore;
use refund_daemon::categories::fetch_available_categories;
use refund_daemon::token::RefreshingBearerToken;
use refund_daemon::{build_app, AppState};
use refund_graph_store::GraphStore;
use refund_llm::LlmClient;
use refund_mail_ingress::{GmailCredentials, GmailProvider, HttpTaskQueue, IngressHandler};
use refund_orders_db::OrdersDb;
use refund_vision_tool::VisionToolHandler;

#[derive(Parser, Debug)]
#[command(name = "refund-daemon", version, about = "HTTP daemon for mail ingress and case processing")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Enable verbose request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    refund_telemetry::init_json(args.debug);

    let config = RuntimeConfig::from_env().context("load runtime configuration")?;

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.orders_db.connection_string)
        .await
        .context("connect to orders database")?;
    let db = OrdersDb::from_pool(db_pool.clone());

    let cursor_store = PostgresCursorStore::new(db_pool);
    cursor_store.ensure_schema().await.context("ensure history_cursors schema")?;

    let graph = GraphStore::connect_with_retry(&config.graph.uri, &config.graph.user, &config.graph.password)
        .await
        .context("connect to graph store")?;

    let credentials_raw = tokio::fs::read_to_string(&config.mail.credentials_path)
        .await
        .with_context(|| format!("read gmail credentials at {}", config.mail.credentials_path))?;
    let credentials: GmailCredentials =
        serde_json::from_str(&credentials_raw).context("parse gmail credentials")?;
    let mail_provider = GmailProvider::new(credentials);

    let http = reqwest::Client::new();
    let bearer = RefreshingBearerToken::start(http).await.context("start blob store token refresher")?;
    let blob_store = GcsBlobStore::new(config.blob.bucket.clone(), bearer);

    let task_queue = HttpTaskQueue::new(
        config.task_queue.processor_url.clone(),
        config.task_queue.service_account_email.clone(),
    );

    let llm = LlmClient::new(config.llm.api_key.clone());
    let available_categories = fetch_available_categories(&graph).await.context("load policy categories")?;
    info!(target: "refund.daemon", categories = available_categories.len(), "loaded policy categories");

    let ingress = IngressHandler::new(
        mail_provider,
        cursor_store,
        blob_store.clone(),
        task_queue,
        llm.clone(),
        config.llm.extraction_model.clone(),
        config.blob.bucket.clone(),
    );

    let state = Arc::new(AppState {
        ingress,
        blob: blob_store,
        db,
        graph,
        model: config.llm.adjudicator_model.clone(),
        vision: VisionToolHandler::new(llm.clone(), config.llm.adjudicator_model.clone()),
        llm,
        available_categories,
    });

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await.with_context(|| format!("bind {}", args.bind))?;
    info!(target: "refund.daemon", bind = %args.bind, "refund-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
