//! Structured logging init, called exactly once per binary's `main`.
//!
//! §3.6 invariant 6 forbids attachment bytes, raw email bodies, or raw
//! LLM prompts in any log line. There's no way to enforce that at the
//! type level across every call site, so it's a convention: every
//! `tracing` call in this workspace logs ids, lengths, and structured
//! facts (`case_id`, `run_id`, `step`, `tool`, `backend`), never the
//! payload itself. Reviewers should flag any `%body` or `%bytes` in a
//! log macro.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. `debug` widens the
/// default filter; `RUST_LOG` always wins if set.
pub fn init(debug: bool) {
    let default_filter = if debug {
        "refund=debug,refund_case_worker=debug,refund_verification=debug,refund_adjudicator=debug"
    } else {
        "refund=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Initializes a subscriber that emits one JSON object per line, used by
/// the daemon in production where log lines feed a collector.
pub fn init_json(debug: bool) {
    let default_filter = if debug { "refund=debug" } else { "refund=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().json().with_env_filter(filter).init();
}

/// Structured fields every step-boundary log should carry. Not a macro
/// wrapper — callers still use `tracing::info!` directly — but a
/// reminder of the field names to keep consistent across crates.
pub mod fields {
    pub const CASE_ID: &str = "case_id";
    pub const RUN_ID: &str = "run_id";
    pub const STEP: &str = "step";
    pub const TOOL: &str = "tool";
    pub const BACKEND: &str = "backend";
}
