mod compile;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use refund_blob_store::{fetch_metadata_server_access_token, GcsBlobStore, StaticBearerToken};
use refund_config::RuntimeConfig;
use refund_graph_store::GraphStore;
use refund_llm::LlmClient;

/// Exit code for runtime errors (argument errors come from clap with 2).
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "refund-cli", version, about = "Offline policy-compiler CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the R -> S -> T -> U -> V policy-compiler pipeline and load
    /// the result into the configured graph.
    CompilePolicy {
        /// Directory containing return-policy PDFs.
        #[arg(long)]
        pdf_dir: PathBuf,

        /// Clear the target graph before loading.
        #[arg(long)]
        clear_graph: bool,

        /// Where to write the compile report (defaults to ./compile-report.json).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print a previously written compile report's summary.
    Inspect {
        /// Path to a compile report JSON file.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    refund_telemetry::init(cli.debug);

    let result = match cli.command {
        Commands::CompilePolicy { pdf_dir, clear_graph, out } => cmd_compile_policy(pdf_dir, clear_graph, out).await,
        Commands::Inspect { file } => cmd_inspect(&file),
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn cmd_compile_policy(pdf_dir: PathBuf, clear_graph: bool, out: Option<PathBuf>) -> Result<()> {
    let config = RuntimeConfig::from_env().context("load runtime configuration")?;

    let llm = LlmClient::new(config.llm.api_key.clone());
    let store = GraphStore::connect_with_retry(&config.graph.uri, &config.graph.user, &config.graph.password)
        .await
        .context("connect to graph store")?;

    let http = reqwest::Client::new();
    let token = fetch_metadata_server_access_token(&http).await.context("fetch blob store access token")?;
    let blobs = GcsBlobStore::new(config.blob.bucket.clone(), StaticBearerToken(token));

    let models = compile::CompileModels {
        ontology: &config.llm.ontology_model,
        extraction: &config.llm.extraction_model,
        critic: &config.llm.critic_model,
    };

    let report = compile::run(&llm, models, &store, &blobs, &pdf_dir, clear_graph)
        .await
        .context("run policy compiler pipeline")?;

    let out_path = out.unwrap_or_else(|| PathBuf::from("compile-report.json"));
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    std::fs::write(&out_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("write compile report to {}", out_path.display()))?;

    eprintln!("status: {:?}", report.build_log.status);
    eprintln!("attempts: {}", report.attempts.len());
    eprintln!("nodes loaded: {}", report.build_log.verify.total_nodes);
    eprintln!("report: {}", out_path.display());

    if !matches!(report.build_log.status, refund_graph_builder::BuildStatus::Success) {
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}

fn cmd_inspect(file: &std::path::Path) -> Result<()> {
    let content = std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let report: serde_json::Value = serde_json::from_str(&content).with_context(|| format!("parse {}", file.display()))?;

    println!("status: {}", report.get("build_log").and_then(|b| b.get("status")).map(|v| v.to_string()).unwrap_or_default());
    println!("attempts: {}", report.get("attempts").and_then(|a| a.as_array()).map(|a| a.len()).unwrap_or(0));
    println!(
        "nodes: {}",
        report
            .get("build_log")
            .and_then(|b| b.get("verify"))
            .and_then(|v| v.get("total_nodes"))
            .map(|v| v.to_string())
            .unwrap_or_default()
    );
    Ok(())
}
