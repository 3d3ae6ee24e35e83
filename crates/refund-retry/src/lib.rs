//! Generic exponential-backoff-with-jitter retry loop, shared by the LLM
//! adapter, the graph-store adapter's connection retry, and the policy
//! builder's cold-start connect retry (§5, §7).
//!
//! Each call site supplies its own error type and its own retryability
//! predicate over [`refund_error::ErrorCategory`]; the loop itself is
//! policy-free.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

use refund_error::Classify;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    #[serde(with = "duration_millis")]
    pub overall_timeout: Duration,
    /// `[0.0, 1.0]`, 0 = no jitter, 1 = full jitter.
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// §7: LLM adapter budget — 10 retries, base 2s, factor 2 (the
    /// doubling is intrinsic to `compute_delay`), cap 10.
    pub fn llm_default() -> RetryConfig {
        RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            overall_timeout: Duration::from_secs(300),
            jitter_factor: 0.5,
        }
    }

    /// §7/§4.V: graph connection retry — 3 attempts, up to 10s per step.
    pub fn graph_connect_default() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(40),
            jitter_factor: 0.3,
        }
    }

    /// §4.U: critic LLM call retry-on-503/429, base 5s.
    pub fn critic_default() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            overall_timeout: Duration::from_secs(300),
            jitter_factor: 0.5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    pub total_attempts: u32,
    pub failed_attempts: Vec<RetryAttempt>,
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
}

impl RetryMetadata {
    pub fn to_case_metadata(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("retry_total_attempts".into(), serde_json::json!(self.total_attempts));
        map.insert(
            "retry_total_duration_ms".into(),
            serde_json::json!(self.total_duration.as_millis() as u64),
        );
        map
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub metadata: RetryMetadata,
}

/// Same pseudo-random jitter derivation as the host retry loop this is
/// modeled on: nanosecond clock mixed with the attempt index, not a true
/// RNG. Good enough to avoid thundering-herd retries across cases.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 { pseudo % jitter_range } else { 0 };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Generic retry-on-transient loop. `retryable` decides whether an
/// error's [`refund_error::ErrorCategory`] should trigger a retry —
/// callers typically pass `|e| e.category() == ErrorCategory::Transient`.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<RetryOutcome<T>, E>
where
    E: Classify,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let max_attempts = config.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        if start.elapsed() >= config.overall_timeout {
            warn!(target: "refund.retry", attempt, "overall timeout exceeded before attempt");
            break;
        }

        debug!(target: "refund.retry", attempt, max_attempts, "attempting operation");

        match op().await {
            Ok(value) => {
                let total_duration = start.elapsed();
                debug!(
                    target: "refund.retry",
                    attempt,
                    total_duration_ms = total_duration.as_millis() as u64,
                    "operation succeeded"
                );
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                        total_duration,
                    },
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;

                if !retryable(&err) {
                    debug!(target: "refund.retry", error = %format_err(&err), "non-retryable, giving up");
                    return Err(err);
                }

                if is_last {
                    warn!(target: "refund.retry", error = %format_err(&err), attempt, "retries exhausted");
                    return Err(err);
                }

                let delay = compute_delay(config, attempt);
                warn!(
                    target: "refund.retry",
                    error = %format_err(&err),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable error, backing off"
                );

                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: format_err(&err),
                    delay,
                });

                let remaining = config.overall_timeout.saturating_sub(start.elapsed());
                if delay > remaining {
                    return Err(err);
                }

                tokio::time::sleep(delay).await;
            }
        }
    }

    // Every branch above returns; reached only if max_attempts == 0.
    op().await
}

fn format_err<E: std::fmt::Display>(err: &E) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum FakeError {
        #[error("transient: {0}")]
        Transient(String),
        #[error("permanent: {0}")]
        Permanent(String),
    }

    impl Classify for FakeError {
        fn code(&self) -> refund_error::ErrorCode {
            match self {
                FakeError::Transient(_) => refund_error::ErrorCode::LlmTimeout,
                FakeError::Permanent(_) => refund_error::ErrorCode::LlmRefusal,
            }
        }
    }

    fn is_transient(e: &FakeError) -> bool {
        matches!(e, FakeError::Transient(_))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_retries() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            overall_timeout: Duration::from_secs(5),
            jitter_factor: 0.0,
        };
        let outcome = retry_async(
            &config,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError::Transient("not yet".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            is_transient,
        )
        .await
        .expect("eventually succeeds");

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.metadata.total_attempts, 3);
        assert_eq!(outcome.metadata.failed_attempts.len(), 2);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let attempts = Cell::new(0);
        let config = RetryConfig::default();
        let result: Result<RetryOutcome<()>, FakeError> = retry_async(
            &config,
            || {
                attempts.set(attempts.get() + 1);
                async { Err(FakeError::Permanent("no".into())) }
            },
            is_transient,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn compute_delay_is_capped_at_max() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            overall_timeout: Duration::from_secs(60),
            jitter_factor: 0.0,
        };
        let delay = compute_delay(&config, 8);
        assert_eq!(delay, Duration::from_millis(500));
    }
}
