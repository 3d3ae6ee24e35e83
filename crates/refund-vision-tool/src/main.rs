use refund_llm::LlmClient;
use refund_vision_tool::VisionToolHandler;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(true).init();

    let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
        tracing::warn!(target: "refund.vision_tool", "GEMINI_API_KEY unset; calls will fail at the provider");
        String::new()
    });
    let model = std::env::var("VISION_MODEL").unwrap_or_else(|_| "gemini-2.5-pro".to_string());

    let handler = VisionToolHandler::new(LlmClient::new(api_key), model);

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    if let Err(err) = refund_tool_proto::run_server(&handler, stdin, stdout).await {
        tracing::error!(target: "refund.vision_tool", error = %err, "tool server exited with an error");
        std::process::exit(1);
    }
}
