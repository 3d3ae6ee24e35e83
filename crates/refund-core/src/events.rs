//! §4.L streaming event shape, shared between the in-process channel the
//! case worker emits on and the SSE façade over the same channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Active,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub step: String,
    pub status: StepStatus,
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substep: Option<String>,
}

impl PipelineEvent {
    pub fn active(step: impl Into<String>, log: impl Into<String>) -> Self {
        PipelineEvent {
            step: step.into(),
            status: StepStatus::Active,
            log: log.into(),
            data: None,
            substep: None,
        }
    }

    pub fn complete(step: impl Into<String>, log: impl Into<String>, data: Option<Value>) -> Self {
        PipelineEvent {
            step: step.into(),
            status: StepStatus::Complete,
            log: log.into(),
            data,
            substep: None,
        }
    }

    pub fn error(step: impl Into<String>, log: impl Into<String>) -> Self {
        PipelineEvent {
            step: step.into(),
            status: StepStatus::Error,
            log: log.into(),
            data: None,
            substep: None,
        }
    }

    pub fn with_substep(mut self, substep: impl Into<String>) -> Self {
        self.substep = Some(substep.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_expected_status() {
        assert_eq!(PipelineEvent::active("parse", "starting").status, StepStatus::Active);
        assert_eq!(PipelineEvent::complete("parse", "done", None).status, StepStatus::Complete);
        assert_eq!(PipelineEvent::error("parse", "boom").status, StepStatus::Error);
    }

    #[test]
    fn substep_is_attached_after_construction() {
        let event = PipelineEvent::active("verify", "calling tool").with_substep("find_order_by_invoice_number");
        assert_eq!(event.substep.as_deref(), Some("find_order_by_invoice_number"));
    }
}
