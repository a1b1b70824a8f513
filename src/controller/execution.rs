//! NodeExecution: one pipeline attempt on one node, owned by a request

use crate::pipeline::{PipelineOutcome, PipelineReport, StageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Succeeded | ExecutionPhase::Failed | ExecutionPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub node_id: String,
    pub parent_request_id: String,
    pub attempt: u32,
    pub phase: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether a failure is worth another attempt
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    pub fn new(request_id: &str, node: &str, attempt: u32) -> Self {
        Self {
            node_id: node.to_string(),
            parent_request_id: request_id.to_string(),
            attempt,
            phase: ExecutionPhase::Pending,
            reason: None,
            retryable: false,
            stage_results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn started(mut self) -> Self {
        self.phase = ExecutionPhase::Running;
        self.started_at = Some(Utc::now());
        self
    }

    /// Fold a finished pipeline run into the record
    pub fn finished(mut self, report: PipelineReport) -> Self {
        let (phase, reason, retryable) = match &report.outcome {
            PipelineOutcome::Succeeded => (ExecutionPhase::Succeeded, None, false),
            PipelineOutcome::Failed { reason, retryable } => {
                (ExecutionPhase::Failed, Some(reason.clone()), *retryable)
            }
            PipelineOutcome::Cancelled => (
                ExecutionPhase::Cancelled,
                Some("cancelled".to_string()),
                false,
            ),
        };
        self.phase = phase;
        self.reason = reason;
        self.retryable = retryable;
        self.stage_results = report.stage_results;
        self.finished_at = Some(report.finished_at);
        self
    }

    pub fn cancelled(mut self, reason: impl Into<String>) -> Self {
        self.phase = ExecutionPhase::Cancelled;
        self.reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        self
    }
}
