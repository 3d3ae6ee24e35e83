//! Unified error taxonomy shared by every crate in the workspace.
//!
//! Each crate defines its own `thiserror` enum for the failures it can
//! produce locally, then implements [`Classify`] to map those local
//! variants onto the stable [`ErrorCode`]/[`ErrorCategory`] pair defined
//! here. Callers that only care about retry/escalation behavior match on
//! the category; callers that need precise diagnostics match on the code.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse bucket used to decide how a failure should be handled upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Likely to succeed on retry: network blips, rate limits, timeouts.
    Transient,
    /// Will not succeed on retry without a code or data change.
    Permanent,
    /// A tool or model produced output that failed schema validation.
    Schema,
    /// A policy rule could not be evaluated or produced an ambiguous result.
    Policy,
    /// The data read back from a store is missing, contradictory, or stale.
    DataIntegrity,
    /// Startup or environment configuration is missing or invalid.
    Configuration,
    /// Unrecoverable; the process should stop rather than continue degraded.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Schema => "schema",
            ErrorCategory::Policy => "policy",
            ErrorCategory::DataIntegrity => "data_integrity",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

macro_rules! error_codes {
    ($($variant:ident => $category:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum ErrorCode {
            $($variant),+
        }

        impl ErrorCode {
            pub fn category(&self) -> ErrorCategory {
                match self {
                    $(ErrorCode::$variant => ErrorCategory::$category),+
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => stringify!($variant)),+
                }
            }

            pub const ALL: &'static [ErrorCode] = &[
                $(ErrorCode::$variant),+
            ];
        }
    };
}

error_codes! {
    LlmTimeout => Transient,
    LlmRateLimited => Transient,
    LlmConnectionReset => Transient,
    ToolUnreachable => Transient,
    GraphStoreUnavailable => Transient,
    OrdersDbUnavailable => Transient,

    LlmRefusal => Permanent,
    ToolArgumentInvalid => Permanent,
    UnsupportedAttachmentType => Permanent,
    CursorConflict => Permanent,

    LlmSchemaViolation => Schema,
    ToolResultSchemaViolation => Schema,
    CitationMissing => Schema,

    PolicyRuleAmbiguous => Policy,
    PolicyRuleConflict => Policy,
    PolicyNotCompiled => Policy,

    OrderNotFound => DataIntegrity,
    IdentityMismatch => DataIntegrity,
    DuplicateCase => DataIntegrity,
    RefundExceedsEligible => DataIntegrity,
    SqlValidationFailed => DataIntegrity,

    MissingEnvVar => Configuration,
    InvalidEnvVar => Configuration,

    BudgetExhausted => Fatal,
    PoisonedState => Fatal,
}

/// Implemented by every crate-local error enum to project onto the
/// shared taxonomy without losing the original error as a source.
pub trait Classify: std::error::Error {
    fn code(&self) -> ErrorCode;

    fn category(&self) -> ErrorCategory {
        self.code().category()
    }
}

/// A taxonomy-tagged error with structured context, used at crate
/// boundaries where callers need more than a `Display` string.
pub struct RefundError {
    code: ErrorCode,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    context: BTreeMap<String, Value>,
}

impl RefundError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

impl fmt::Debug for RefundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefundError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl fmt::Display for RefundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RefundError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`RefundError`], used in receipts and API
/// responses where the opaque `source` can't cross a process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundErrorDto {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    pub source_message: Option<String>,
    pub context: BTreeMap<String, Value>,
}

impl From<&RefundError> for RefundErrorDto {
    fn from(err: &RefundError) -> Self {
        RefundErrorDto {
            code: err.code,
            category: err.category(),
            message: err.message.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
            context: err.context.clone(),
        }
    }
}

impl From<RefundError> for RefundErrorDto {
    fn from(err: RefundError) -> Self {
        RefundErrorDto::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn category_mapping_is_stable() {
        assert_eq!(ErrorCode::LlmTimeout.category(), ErrorCategory::Transient);
        assert_eq!(ErrorCode::OrderNotFound.category(), ErrorCategory::DataIntegrity);
        assert_eq!(ErrorCode::MissingEnvVar.category(), ErrorCategory::Configuration);
        assert_eq!(ErrorCode::BudgetExhausted.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn all_codes_unique() {
        let set: BTreeSet<&str> = ErrorCode::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(set.len(), ErrorCode::ALL.len());
    }

    #[test]
    fn display_includes_code_and_source() {
        let inner = std::io::Error::other("boom");
        let err = RefundError::new(ErrorCode::ToolUnreachable, "doc tool did not respond")
            .with_source(inner)
            .with_context("tool", "doc_parser");
        let rendered = err.to_string();
        assert!(rendered.contains("TOOL_UNREACHABLE"));
        assert!(rendered.contains("boom"));
        assert!(err.is_retryable());
    }

    #[test]
    fn dto_drops_source_but_keeps_message() {
        let err = RefundError::new(ErrorCode::CitationMissing, "no evidence span cited");
        let dto: RefundErrorDto = (&err).into();
        assert_eq!(dto.code, ErrorCode::CitationMissing);
        assert_eq!(dto.category, ErrorCategory::Schema);
        assert!(dto.source_message.is_none());
    }

    #[test]
    fn non_transient_categories_are_not_retryable() {
        let err = RefundError::new(ErrorCode::PolicyRuleConflict, "two rules disagree");
        assert!(!err.is_retryable());
    }
}
