use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{NewStep, Step, StepType, Storage};

use super::{
    classify_step, compute_confidence, compute_progress, default_suggestion, AdapterRegistry,
    Extraction, ProgressiveStepRequest, ProgressiveStepResponse, ResponseStatus, ToolAdapter,
};

/// Analyzer behavior switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerSettings {
    /// Require every step number to be exactly `latest + 1`.
    pub strict_sequence: bool,
}

impl From<&EngineConfig> for AnalyzerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            strict_sequence: config.strict_sequence,
        }
    }
}

/// A request that passed validation against the current branch state.
struct PlannedStep {
    step_number: u32,
    total_steps: u32,
    /// `total_steps` was raised to `step_number` by `needs_more_steps`.
    extended: bool,
    is_revision: bool,
    parent_branch_id: Option<String>,
}

/// Generic engine behind every progressive tool.
///
/// For each request it validates the branch and revision references against
/// what is already stored, classifies the step (adapter hint first, default
/// progression otherwise), computes confidence and progress, and persists the
/// step with a single compare-and-insert. Validation happens before the
/// session is ensured, so a rejected request leaves nothing behind.
#[derive(Clone)]
pub struct ProgressiveAnalyzer {
    storage: Arc<dyn Storage>,
    adapters: AdapterRegistry,
    settings: AnalyzerSettings,
}

impl ProgressiveAnalyzer {
    /// Create an analyzer over the given storage and adapters
    pub fn new(storage: Arc<dyn Storage>, adapters: AdapterRegistry) -> Self {
        Self {
            storage,
            adapters,
            settings: AnalyzerSettings::default(),
        }
    }

    /// Override the analyzer settings
    pub fn with_settings(mut self, settings: AnalyzerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Registered adapters.
    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Process one step for `tool_name` in `session_id`.
    pub async fn process(
        &self,
        tool_name: &str,
        session_id: &str,
        request: &ProgressiveStepRequest,
    ) -> EngineResult<ProgressiveStepResponse> {
        let start = Instant::now();
        validate_request(tool_name, session_id, request)?;

        let branch_id = request.branch_id.as_deref();

        if let Some(existing) = self.storage.get_session(session_id).await? {
            ensure_same_tool(&existing.tool_name, tool_name, session_id)?;
        }

        let prior = self.storage.list_steps(session_id, branch_id).await?;
        let planned = self.plan(session_id, request, &prior).await?;

        debug!(
            session_id = %session_id,
            tool = %tool_name,
            step_number = planned.step_number,
            branch_id = ?branch_id,
            prior_steps = prior.len(),
            "Processing progressive step"
        );

        let adapter = self.adapters.get(tool_name);
        let step_type = classify(adapter.as_deref(), request, &planned, &prior);
        let confidence = compute_confidence(step_type, prior.len(), planned.is_revision);
        let extraction = adapter
            .as_ref()
            .map(|a| a.extract(&request.content, &prior))
            .unwrap_or_default();

        let session = self
            .storage
            .get_or_create_session(session_id, tool_name)
            .await?;
        ensure_same_tool(&session.tool_name, tool_name, session_id)?;

        let mut draft = NewStep::new(
            session_id,
            planned.step_number,
            planned.total_steps,
            request.content.clone(),
            step_type,
        )
        .with_confidence(confidence)
        .with_next_step_needed(request.next_step_needed)
        .with_metadata(merge_metadata(
            request.metadata.as_ref(),
            tool_name,
            &extraction,
        ));
        if let Some(branch) = branch_id {
            draft = draft.on_branch(branch);
        }
        if let Some(from) = request.branch_from_step {
            draft = draft.forked_from(planned.parent_branch_id.clone(), from);
        }
        if let Some(revised) = request.revises_step {
            draft = draft.revising(revised);
        }

        let step = match self.storage.save_step(&draft).await {
            Ok(step) => step,
            Err(e) => {
                let err = EngineError::from(e);
                warn!(
                    session_id = %session_id,
                    step_number = planned.step_number,
                    branch_id = ?branch_id,
                    error = %err,
                    "Step write rejected"
                );
                return Err(err);
            }
        };

        let suggestion = request.next_step_needed.then(|| match &adapter {
            Some(adapter) => adapter.suggest(step_type, &request.content),
            None => default_suggestion(step_type).to_string(),
        });

        info!(
            session_id = %session_id,
            tool = %tool_name,
            step_id = step.id,
            step_number = step.step_number,
            branch_id = ?branch_id,
            step_type = %step_type,
            latency_ms = start.elapsed().as_millis() as u64,
            "Progressive step recorded"
        );

        Ok(ProgressiveStepResponse {
            session_id: session_id.to_string(),
            step_id: Some(step.id),
            step_number: step.step_number,
            total_steps: step.total_steps,
            status: ResponseStatus::Success,
            next_step_needed: step.next_step_needed,
            is_revision: step.is_revision,
            branch_id: step.branch_id.clone(),
            message: describe(&step, &planned),
            suggestion,
            confidence: step.confidence,
            step_type: Some(step.step_type),
            progress: compute_progress(
                step.step_number,
                step.total_steps,
                prior.len() + 1,
                step.branch_id.as_deref(),
            ),
            error: None,
            error_code: None,
        })
    }

    /// Resolve numbering, totals, branch and revision references against the
    /// steps already stored in the target namespace.
    async fn plan(
        &self,
        session_id: &str,
        request: &ProgressiveStepRequest,
        prior: &[Step],
    ) -> EngineResult<PlannedStep> {
        let latest = prior.last();
        let latest_number = latest.map_or(0, |s| s.step_number);

        let step_number = match request.step_number {
            Some(n) => n,
            None => latest_number.checked_add(1).ok_or_else(|| {
                EngineError::validation("step_number", "step numbering exhausted")
            })?,
        };
        if step_number <= latest_number {
            return Err(EngineError::Conflict {
                session_id: session_id.to_string(),
                branch_id: request.branch_id.clone(),
                step_number,
            });
        }
        // step_number > latest_number, so this cannot overflow.
        let expected = latest_number + 1;
        if self.settings.strict_sequence && step_number != expected {
            return Err(EngineError::validation(
                "step_number",
                format!("expected step {}, got {}", expected, step_number),
            ));
        }

        let extended = step_number > request.total_steps;
        let total_steps = if extended {
            if !request.needs_more_steps {
                return Err(EngineError::validation(
                    "total_steps",
                    format!(
                        "step {} exceeds total_steps {}; set needs_more_steps to extend",
                        step_number, request.total_steps
                    ),
                ));
            }
            step_number
        } else {
            request.total_steps
        };
        if let Some(latest) = latest {
            if total_steps < latest.total_steps {
                return Err(EngineError::validation(
                    "total_steps",
                    format!(
                        "cannot decrease from {} to {}",
                        latest.total_steps, total_steps
                    ),
                ));
            }
        }

        let parent_branch_id = self.check_fork(session_id, request, prior).await?;

        if let Some(revised) = request.revises_step {
            if revised >= step_number {
                return Err(EngineError::validation(
                    "revises_step",
                    format!("must be less than step_number {}", step_number),
                ));
            }
            if !prior.iter().any(|s| s.step_number == revised) {
                return Err(EngineError::validation(
                    "revises_step",
                    format!("step {} does not exist in this branch", revised),
                ));
            }
        }

        Ok(PlannedStep {
            step_number,
            total_steps,
            extended,
            is_revision: request.revises_step.is_some(),
            parent_branch_id,
        })
    }

    /// Validate the fork point of a branch step, returning the parent namespace.
    async fn check_fork(
        &self,
        session_id: &str,
        request: &ProgressiveStepRequest,
        prior: &[Step],
    ) -> EngineResult<Option<String>> {
        let Some(branch_id) = request.branch_id.as_deref() else {
            return Ok(None);
        };

        // Continuing an existing branch: any fork point given must match the recorded one.
        if let Some(first) = prior.first() {
            if let Some(from) = request.branch_from_step {
                let same_parent = request.parent_branch_id.is_none()
                    || request.parent_branch_id == first.parent_branch_id;
                if first.branch_from_step != Some(from) || !same_parent {
                    return Err(EngineError::validation(
                        "branch_from_step",
                        format!(
                            "branch {} already forked from step {}",
                            branch_id,
                            first.branch_from_step.unwrap_or_default()
                        ),
                    ));
                }
            }
            return Ok(first.parent_branch_id.clone());
        }

        let Some(from) = request.branch_from_step else {
            return Err(EngineError::validation(
                "branch_from_step",
                format!("required to start branch {}", branch_id),
            ));
        };

        let parent = request.parent_branch_id.as_deref();
        let fork_point = self
            .storage
            .get_step_by_number(session_id, parent, from)
            .await?;
        if fork_point.is_none() {
            let parent_label = parent.map_or_else(
                || "the main line".to_string(),
                |p| format!("branch {}", p),
            );
            return Err(EngineError::validation(
                "branch_from_step",
                format!("step {} does not exist in {}", from, parent_label),
            ));
        }

        Ok(request.parent_branch_id.clone())
    }
}

fn validate_request(
    tool_name: &str,
    session_id: &str,
    request: &ProgressiveStepRequest,
) -> EngineResult<()> {
    if tool_name.trim().is_empty() {
        return Err(EngineError::validation("tool_name", "cannot be empty"));
    }
    if session_id.trim().is_empty() {
        return Err(EngineError::validation("session_id", "cannot be empty"));
    }
    if request.content.trim().is_empty() {
        return Err(EngineError::validation("content", "cannot be empty"));
    }
    if request.total_steps < 1 {
        return Err(EngineError::validation("total_steps", "must be at least 1"));
    }
    if request.step_number == Some(0) {
        return Err(EngineError::validation("step_number", "must be at least 1"));
    }
    if request.is_revision && request.revises_step.is_none() {
        return Err(EngineError::validation(
            "revises_step",
            "required when is_revision is true",
        ));
    }
    match request.branch_id.as_deref() {
        Some(branch) if branch.trim().is_empty() => {
            return Err(EngineError::validation("branch_id", "cannot be empty"));
        }
        Some(branch) if request.parent_branch_id.as_deref() == Some(branch) => {
            return Err(EngineError::validation(
                "parent_branch_id",
                "a branch cannot fork from itself",
            ));
        }
        None if request.branch_from_step.is_some() => {
            return Err(EngineError::validation(
                "branch_id",
                "required when branch_from_step is set",
            ));
        }
        None if request.parent_branch_id.is_some() => {
            return Err(EngineError::validation(
                "branch_id",
                "required when parent_branch_id is set",
            ));
        }
        _ => {}
    }
    Ok(())
}

fn ensure_same_tool(existing: &str, requested: &str, session_id: &str) -> EngineResult<()> {
    if existing != requested {
        return Err(EngineError::validation(
            "session_id",
            format!(
                "session {} belongs to tool {}, not {}",
                session_id, existing, requested
            ),
        ));
    }
    Ok(())
}

fn classify(
    adapter: Option<&dyn ToolAdapter>,
    request: &ProgressiveStepRequest,
    planned: &PlannedStep,
    prior: &[Step],
) -> StepType {
    adapter
        .and_then(|a| a.classify(&request.content, prior))
        .unwrap_or_else(|| {
            // An extension step only concludes when the caller says nothing follows.
            let total_steps = if planned.extended && request.next_step_needed {
                request.total_steps
            } else {
                planned.total_steps
            };
            let prior_types: Vec<StepType> = prior.iter().map(|s| s.step_type).collect();
            classify_step(planned.step_number, total_steps, &prior_types)
        })
}

/// Caller metadata plus the tool name and any adapter extraction.
///
/// Object metadata is merged key by key; any other JSON value is kept under
/// `"data"`.
fn merge_metadata(caller: Option<&Value>, tool_name: &str, extraction: &Extraction) -> Value {
    let mut map = match caller {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
        None => Map::new(),
    };
    map.insert("tool_name".to_string(), Value::String(tool_name.to_string()));
    if !extraction.is_empty() {
        if let Ok(value) = serde_json::to_value(extraction) {
            map.insert("extraction".to_string(), value);
        }
    }
    Value::Object(map)
}

fn describe(step: &Step, planned: &PlannedStep) -> String {
    let mut message = format!(
        "Step {}/{} recorded as {}",
        step.step_number, step.total_steps, step.step_type
    );
    if let Some(branch) = &step.branch_id {
        message.push_str(&format!(" on branch {}", branch));
        if let Some(from) = step.branch_from_step {
            let parent = planned
                .parent_branch_id
                .as_deref()
                .map_or_else(|| "main line".to_string(), |p| format!("branch {}", p));
            message.push_str(&format!(" (forked from {} step {})", parent, from));
        }
    }
    if let Some(revised) = step.revises_step {
        message.push_str(&format!(", revising step {}", revised));
    }
    if !step.next_step_needed {
        message.push_str("; reasoning complete");
    }
    message
}

#[cfg(test)]
#[path = "analyzer_tests.rs"]
mod analyzer_tests;
