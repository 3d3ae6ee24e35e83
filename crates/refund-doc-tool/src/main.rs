use refund_doc_tool::DocToolHandler;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(true).init();

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let handler = DocToolHandler;

    if let Err(err) = refund_tool_proto::run_server(&handler, stdin, stdout).await {
        tracing::error!(target: "refund.doc_tool", error = %err, "tool server exited with an error");
        std::process::exit(1);
    }
}
