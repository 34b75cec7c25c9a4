//! Boundary between external callers and the progressive analyzer.
//!
//! The orchestrator is stateless between calls: every request is mapped onto
//! the analyzer or the stores, and step errors are folded into a structured
//! response instead of escaping to the caller.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{BranchInfo, Session, SessionFilter, Step, StepQuery, Storage};

use super::{
    current_chain, AdapterRegistry, AnalyzerSettings, ProgressiveAnalyzer, ProgressiveStepRequest,
    ProgressiveStepResponse,
};

/// Which steps [`SessionOrchestrator::get_session`] returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepView {
    /// Only this branch; the main line when unset.
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Every namespace, main line first. Overrides `branch_id`.
    #[serde(default)]
    pub all_branches: bool,
    /// Show only the latest step for each logical position.
    #[serde(default)]
    pub resolve_revisions: bool,
}

/// A session with the steps selected by a [`StepView`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session: Session,
    pub steps: Vec<Step>,
    pub branches: Vec<BranchInfo>,
}

/// Latest state of one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub step_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_step: Option<Step>,
}

/// Overview of a session across all of its branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: Session,
    pub total_steps: u64,
    pub branches: Vec<BranchSummary>,
    /// The latest main-line step declared that no more steps are needed.
    pub complete: bool,
}

/// Maps tool calls onto the analyzer and the stores
#[derive(Clone)]
pub struct SessionOrchestrator {
    storage: Arc<dyn Storage>,
    analyzer: ProgressiveAnalyzer,
    config: EngineConfig,
}

impl SessionOrchestrator {
    /// Create an orchestrator over the given storage and adapters
    pub fn new(storage: Arc<dyn Storage>, adapters: AdapterRegistry, config: EngineConfig) -> Self {
        let analyzer = ProgressiveAnalyzer::new(storage.clone(), adapters)
            .with_settings(AnalyzerSettings::from(&config));
        Self {
            storage,
            analyzer,
            config,
        }
    }

    /// The underlying analyzer.
    pub fn analyzer(&self) -> &ProgressiveAnalyzer {
        &self.analyzer
    }

    /// Submit one step. Never fails: errors come back as `status = "error"`.
    pub async fn submit_step(
        &self,
        tool_name: &str,
        request: ProgressiveStepRequest,
    ) -> ProgressiveStepResponse {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.analyzer.process(tool_name, &session_id, &request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    tool = %tool_name,
                    code = e.code(),
                    error = %e,
                    "Progressive step failed"
                );
                ProgressiveStepResponse::failure(session_id, &request, &e)
            }
        }
    }

    /// A session and the steps selected by `view`.
    pub async fn get_session(&self, session_id: &str, view: &StepView) -> EngineResult<SessionView> {
        let session = self.require_session(session_id).await?;

        let steps = if view.all_branches {
            self.storage.list_all_steps(session_id).await?
        } else {
            self.storage
                .list_steps(session_id, view.branch_id.as_deref())
                .await?
        };
        let steps = if view.resolve_revisions {
            current_chain(&steps)
        } else {
            steps
        };
        let branches = self.storage.list_branches(session_id).await?;

        Ok(SessionView {
            session,
            steps,
            branches,
        })
    }

    /// Sessions matching `filter`, newest first.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: Option<u32>,
        offset: u32,
    ) -> EngineResult<Vec<Session>> {
        let limit = limit.unwrap_or(self.config.session_list_limit);
        Ok(self.storage.list_sessions(filter, limit, offset).await?)
    }

    /// Per-branch overview of a session.
    pub async fn summarize_session(&self, session_id: &str) -> EngineResult<SessionSummary> {
        let session = self.require_session(session_id).await?;
        let total_steps = self.storage.count_steps(session_id).await?;

        let mut branches = Vec::new();
        for info in self.storage.list_branches(session_id).await? {
            let latest_step = self
                .storage
                .latest_step(session_id, info.branch_id.as_deref())
                .await?;
            branches.push(BranchSummary {
                branch_id: info.branch_id,
                step_count: info.step_count,
                latest_step,
            });
        }

        let complete = branches
            .iter()
            .find(|b| b.branch_id.is_none())
            .and_then(|b| b.latest_step.as_ref())
            .is_some_and(|step| !step.next_step_needed);

        Ok(SessionSummary {
            session,
            total_steps,
            branches,
            complete,
        })
    }

    /// Delete a session and its steps. Returns whether it existed.
    pub async fn delete_session(&self, session_id: &str) -> EngineResult<bool> {
        let deleted = self.storage.delete_session(session_id).await?;
        if deleted {
            info!(session_id = %session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Delete every step of a session, keeping the session itself.
    pub async fn clear_steps(&self, session_id: &str) -> EngineResult<u64> {
        self.require_session(session_id).await?;
        let removed = self.storage.delete_session_steps(session_id).await?;
        info!(session_id = %session_id, removed, "Session steps cleared");
        Ok(removed)
    }

    /// Delete sessions not updated within `older_than_hours`, falling back to
    /// the configured maximum age.
    pub async fn cleanup(&self, older_than_hours: Option<u64>) -> EngineResult<u64> {
        let hours = older_than_hours.unwrap_or(self.config.session_max_age_hours);
        let hours = i64::try_from(hours)
            .map_err(|_| EngineError::validation("older_than_hours", "value too large"))?;
        let age = Duration::try_hours(hours)
            .ok_or_else(|| EngineError::validation("older_than_hours", "value too large"))?;

        let removed = self.storage.cleanup_older_than(age).await?;
        info!(older_than_hours = hours, removed, "Session cleanup completed");
        Ok(removed)
    }

    /// Search steps across sessions.
    pub async fn search_steps(&self, query: &StepQuery) -> EngineResult<Vec<Step>> {
        Ok(self.storage.search_steps(query).await?)
    }

    async fn require_session(&self, session_id: &str) -> EngineResult<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                what: format!("session {}", session_id),
            })
    }
}
