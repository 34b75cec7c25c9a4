use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::storage::StepType;

/// One step submitted by a reasoning tool.
///
/// Field aliases accept the `thought_*` vocabulary used by sequential
/// thinking clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressiveStepRequest {
    /// Session to append to; a new id is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Free text content of the step.
    #[serde(alias = "thought")]
    pub content: String,
    /// Position within the branch; `latest + 1` when absent.
    #[serde(
        default,
        alias = "thought_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub step_number: Option<u32>,
    /// Expected total number of steps.
    #[serde(alias = "total_thoughts")]
    pub total_steps: u32,
    /// Whether more steps will follow.
    #[serde(default = "default_true", alias = "next_thought_needed")]
    pub next_step_needed: bool,
    /// Whether this step revises an earlier one.
    #[serde(default)]
    pub is_revision: bool,
    /// Step number being revised.
    #[serde(
        default,
        alias = "revises_thought",
        skip_serializing_if = "Option::is_none"
    )]
    pub revises_step: Option<u32>,
    /// Step number in the parent namespace this branch forks from.
    #[serde(
        default,
        alias = "branch_from_thought",
        skip_serializing_if = "Option::is_none"
    )]
    pub branch_from_step: Option<u32>,
    /// Branch to write to; `None` for the main line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Namespace the branch forks from; `None` for the main line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    /// Allow `step_number` to exceed `total_steps`, raising the total.
    #[serde(default, alias = "needs_more_thoughts")]
    pub needs_more_steps: bool,
    /// Caller metadata stored with the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ProgressiveStepRequest {
    /// Create a main-line request
    pub fn new(content: impl Into<String>, step_number: u32, total_steps: u32) -> Self {
        Self {
            content: content.into(),
            step_number: Some(step_number),
            total_steps,
            next_step_needed: true,
            ..Default::default()
        }
    }

    /// Set the session ID
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Declare whether more steps will follow
    pub fn with_next_step_needed(mut self, next_step_needed: bool) -> Self {
        self.next_step_needed = next_step_needed;
        self
    }

    /// Mark this step as a revision of `step_number`
    pub fn revising(mut self, step_number: u32) -> Self {
        self.is_revision = true;
        self.revises_step = Some(step_number);
        self
    }

    /// Fork a new branch from `step_number` of the main line
    pub fn branching(mut self, branch_id: impl Into<String>, from_step: u32) -> Self {
        self.branch_id = Some(branch_id.into());
        self.branch_from_step = Some(from_step);
        self
    }

    /// Fork from a parent branch instead of the main line
    pub fn with_parent_branch(mut self, parent_branch_id: impl Into<String>) -> Self {
        self.parent_branch_id = Some(parent_branch_id.into());
        self
    }

    /// Continue an existing branch
    pub fn on_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    /// Allow the step to run past the declared total
    pub fn with_more_steps(mut self) -> Self {
        self.needs_more_steps = true;
        self
    }

    /// Set caller metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Outcome of a step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The step was persisted.
    Success,
    /// Nothing was persisted.
    Error,
}

/// Progress of the branch a step was written to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Steps in the branch including this one.
    pub current_chain_length: usize,
    /// `round(step_number / total_steps * 100)`.
    pub percent_complete: u32,
    /// `max(0, total_steps - step_number)`.
    pub steps_remaining: u32,
    /// `step_number <= total_steps`.
    pub on_track: bool,
    /// Whether the step is on a branch.
    pub branch: bool,
}

/// Structured reply to every step request, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressiveStepResponse {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<i64>,
    pub step_number: u32,
    pub total_steps: u32,
    pub status: ResponseStatus,
    pub next_step_needed: bool,
    pub is_revision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error kind (`validation`, `conflict`, `not_found`, `store_error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ProgressiveStepResponse {
    /// Fold an engine error into an error response echoing the request.
    pub fn failure(
        session_id: impl Into<String>,
        request: &ProgressiveStepRequest,
        err: &EngineError,
    ) -> Self {
        let step_number = request.step_number.unwrap_or(0);
        Self {
            session_id: session_id.into(),
            step_id: None,
            step_number,
            total_steps: request.total_steps,
            status: ResponseStatus::Error,
            next_step_needed: request.next_step_needed,
            is_revision: request.is_revision || request.revises_step.is_some(),
            branch_id: request.branch_id.clone(),
            message: format!("Step rejected: {}", err),
            suggestion: None,
            confidence: 0.0,
            step_type: None,
            progress: Progress {
                current_chain_length: 0,
                percent_complete: 0,
                steps_remaining: request.total_steps.saturating_sub(step_number),
                on_track: step_number <= request.total_steps,
                branch: request.branch_id.is_some(),
            },
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
        }
    }

    /// Whether the step was persisted.
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}
