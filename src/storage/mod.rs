//! Storage layer for progressive reasoning sessions.
//!
//! Two stores are defined here: [`SessionStore`] owns [`Session`] lifetimes
//! and [`StepStore`] owns the append-only log of [`Step`] records. Both are
//! implemented by [`SqliteStorage`] for production and [`MemoryStorage`] for
//! tests and ephemeral runs, and both backends honor the same contract.

mod memory;
mod sqlite;


pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DatabaseConfig, StorageBackend};
use crate::error::{StorageError, StorageResult};

/// A persistent context for one multi-step reasoning run of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier, immutable once created.
    #[serde(rename = "session_id")]
    pub id: String,
    /// Tool driving this session. Never changes after creation.
    pub tool_name: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
    /// Tool-specific metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Whether the session is still accepting work.
    pub active: bool,
}

impl Session {
    /// Create a new session with a generated id
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), tool_name)
    }

    /// Create a new session with a caller-chosen id
    pub fn with_id(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            created_at: now,
            updated_at: now,
            metadata: None,
            active: true,
        }
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Partial update applied by [`SessionStore::update_session`].
///
/// `tool_name` is deliberately absent: it never changes once a session exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    /// Replacement metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// New active flag.
    #[serde(default)]
    pub active: Option<bool>,
}

/// Filter for [`SessionStore::list_sessions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    /// Only sessions driven by this tool.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Only sessions with this active flag.
    #[serde(default)]
    pub active: Option<bool>,
}

impl SessionFilter {
    /// Whether a session passes this filter.
    pub fn matches(&self, session: &Session) -> bool {
        self.tool_name
            .as_deref()
            .map_or(true, |tool| session.tool_name == tool)
            && self.active.map_or(true, |active| session.active == active)
    }
}

/// Kind of reasoning a step performs.
///
/// The variants are listed in the default progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Breaking the problem into parts.
    Decomposition,
    /// Proposing an explanation to test.
    Hypothesis,
    /// Collecting facts that bear on the hypothesis.
    EvidenceGathering,
    /// Spotting recurring structure.
    PatternRecognition,
    /// Deriving consequences from premises.
    LogicalDeduction,
    /// Combining partial results.
    Synthesis,
    /// Checking results against expectations.
    Validation,
    /// Final answer.
    Conclusion,
}

impl StepType {
    /// Every step type, in progression order.
    pub const ALL: [StepType; 8] = [
        StepType::Decomposition,
        StepType::Hypothesis,
        StepType::EvidenceGathering,
        StepType::PatternRecognition,
        StepType::LogicalDeduction,
        StepType::Synthesis,
        StepType::Validation,
        StepType::Conclusion,
    ];

    /// Get the step type name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Decomposition => "decomposition",
            StepType::Hypothesis => "hypothesis",
            StepType::EvidenceGathering => "evidence_gathering",
            StepType::PatternRecognition => "pattern_recognition",
            StepType::LogicalDeduction => "logical_deduction",
            StepType::Synthesis => "synthesis",
            StepType::Validation => "validation",
            StepType::Conclusion => "conclusion",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown step type: {}", s))
    }
}

/// A step about to be persisted. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStep {
    /// Owning session.
    pub session_id: String,
    /// 1-based position within the branch.
    pub step_number: u32,
    /// Caller-declared expected total (advisory).
    pub total_steps: u32,
    /// Free text content.
    pub content: String,
    /// Classified step type.
    pub step_type: StepType,
    /// Confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Branch namespace, `None` for the main line.
    pub branch_id: Option<String>,
    /// Namespace this branch forked from, `None` for the main line.
    pub parent_branch_id: Option<String>,
    /// Step number in the parent namespace this branch forked from.
    pub branch_from_step: Option<u32>,
    /// Step number this step supersedes.
    pub revises_step: Option<u32>,
    /// Whether this step is a revision.
    pub is_revision: bool,
    /// Whether the caller intends to submit more steps.
    pub next_step_needed: bool,
    /// Opaque metadata.
    pub metadata: Option<serde_json::Value>,
}

impl NewStep {
    /// Create a new main-line step draft
    pub fn new(
        session_id: impl Into<String>,
        step_number: u32,
        total_steps: u32,
        content: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            step_number,
            total_steps,
            content: content.into(),
            step_type,
            confidence: 0.8,
            branch_id: None,
            parent_branch_id: None,
            branch_from_step: None,
            revises_step: None,
            is_revision: false,
            next_step_needed: true,
            metadata: None,
        }
    }

    /// Set the confidence level
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Place the step on a branch
    pub fn on_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    /// Record the fork point of the branch
    pub fn forked_from(mut self, parent_branch_id: Option<String>, step_number: u32) -> Self {
        self.parent_branch_id = parent_branch_id;
        self.branch_from_step = Some(step_number);
        self
    }

    /// Mark the step as a revision of an earlier step
    pub fn revising(mut self, step_number: u32) -> Self {
        self.revises_step = Some(step_number);
        self.is_revision = true;
        self
    }

    /// Set whether more steps will follow
    pub fn with_next_step_needed(mut self, next_step_needed: bool) -> Self {
        self.next_step_needed = next_step_needed;
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check the record-level invariants every backend relies on.
    pub fn validate(&self) -> StorageResult<()> {
        let invalid = |reason: String| Err(StorageError::InvalidStep { reason });

        if self.session_id.trim().is_empty() {
            return invalid("session_id cannot be empty".to_string());
        }
        if self.step_number < 1 {
            return invalid("step_number must be at least 1".to_string());
        }
        if self.total_steps < 1 {
            return invalid("total_steps must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return invalid(format!("confidence {} outside [0.0, 1.0]", self.confidence));
        }
        if self.is_revision != self.revises_step.is_some() {
            return invalid("is_revision and revises_step must be set together".to_string());
        }
        if let Some(revised) = self.revises_step {
            if revised < 1 || revised >= self.step_number {
                return invalid(format!(
                    "revises_step {} must be between 1 and {}",
                    revised,
                    self.step_number - 1
                ));
            }
        }
        if matches!(self.branch_id.as_deref(), Some(id) if id.trim().is_empty()) {
            return invalid("branch_id cannot be empty".to_string());
        }
        if self.branch_id.is_some() && self.branch_id == self.parent_branch_id {
            return invalid("a branch cannot fork from itself".to_string());
        }
        if self.branch_from_step.is_some() && self.branch_id.is_none() {
            return invalid("branch_from_step requires a branch_id".to_string());
        }
        Ok(())
    }
}

/// One persisted unit of reasoning. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Store-assigned surrogate key, never reused.
    pub id: i64,
    /// Owning session.
    pub session_id: String,
    /// 1-based position within the branch.
    pub step_number: u32,
    /// Caller-declared expected total.
    pub total_steps: u32,
    /// Free text content.
    pub content: String,
    /// Step type.
    pub step_type: StepType,
    /// Confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Branch namespace, `None` for the main line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Namespace this branch forked from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    /// Step number in the parent namespace this branch forked from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_from_step: Option<u32>,
    /// Step number this step supersedes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revises_step: Option<u32>,
    /// Whether this step is a revision.
    pub is_revision: bool,
    /// Whether the caller declared more steps would follow.
    pub next_step_needed: bool,
    /// Opaque metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// When the step was persisted.
    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Materialize a draft with its store-assigned id.
    pub fn from_new(id: i64, draft: &NewStep, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            session_id: draft.session_id.clone(),
            step_number: draft.step_number,
            total_steps: draft.total_steps,
            content: draft.content.clone(),
            step_type: draft.step_type,
            confidence: draft.confidence,
            branch_id: draft.branch_id.clone(),
            parent_branch_id: draft.parent_branch_id.clone(),
            branch_from_step: draft.branch_from_step,
            revises_step: draft.revises_step,
            is_revision: draft.is_revision,
            next_step_needed: draft.next_step_needed,
            metadata: draft.metadata.clone(),
            created_at,
        }
    }
}

/// Search criteria for [`StepStore::search_steps`]. Unset fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepQuery {
    /// Restrict to one session.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Case-insensitive substring of the content.
    #[serde(default)]
    pub text: Option<String>,
    /// Exact step type.
    #[serde(default)]
    pub step_type: Option<StepType>,
    /// Minimum confidence, inclusive.
    #[serde(default)]
    pub min_confidence: Option<f64>,
    /// Maximum number of results.
    #[serde(default)]
    pub limit: Option<u32>,
}

impl StepQuery {
    /// Whether a step passes this query (limit is applied by the caller).
    pub fn matches(&self, step: &Step) -> bool {
        self.session_id
            .as_deref()
            .map_or(true, |id| step.session_id == id)
            && self.step_type.map_or(true, |t| step.step_type == t)
            && self
                .min_confidence
                .map_or(true, |min| step.confidence >= min)
            && self.text.as_deref().map_or(true, |text| {
                step.content.to_lowercase().contains(&text.to_lowercase())
            })
    }
}

/// Per-branch summary returned by [`StepStore::list_branches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Branch id, `None` for the main line.
    pub branch_id: Option<String>,
    /// Number of steps in the branch.
    pub step_count: u64,
    /// Highest step number in the branch.
    pub latest_step_number: u32,
}

/// Durable store for [`Session`] records keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session. Fails with `DuplicateSession` when the id exists.
    async fn create_session(&self, session: &Session) -> StorageResult<Session>;
    /// Get a session by id.
    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;
    /// Return the existing session or atomically create it.
    async fn get_or_create_session(&self, id: &str, tool_name: &str) -> StorageResult<Session>;
    /// Apply a partial update, always bumping `updated_at`.
    async fn update_session(
        &self,
        id: &str,
        patch: &SessionPatch,
    ) -> StorageResult<Option<Session>>;
    /// List sessions, newest first.
    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> StorageResult<Vec<Session>>;
    /// Delete a session and its steps. Returns whether it existed.
    async fn delete_session(&self, id: &str) -> StorageResult<bool>;
    /// Delete sessions not updated within `age`. Returns the number removed.
    async fn cleanup_older_than(&self, age: Duration) -> StorageResult<u64>;
}

/// Durable append-only store for [`Step`] records keyed by
/// `(session_id, branch_id, step_number)`.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Persist a step, assigning its id.
    ///
    /// This is a single compare-and-insert: it fails with `StepConflict` when
    /// `step_number` is not greater than every step already in the namespace,
    /// which also rejects exact duplicates.
    async fn save_step(&self, step: &NewStep) -> StorageResult<Step>;
    /// Get one step by its position.
    async fn get_step_by_number(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
        step_number: u32,
    ) -> StorageResult<Option<Step>>;
    /// Steps of one namespace (`None` = main line) in ascending order.
    async fn list_steps(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
    ) -> StorageResult<Vec<Step>>;
    /// Steps of every namespace, main line first, then branches by id.
    async fn list_all_steps(&self, session_id: &str) -> StorageResult<Vec<Step>>;
    /// Highest-numbered step of one namespace.
    async fn latest_step(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
    ) -> StorageResult<Option<Step>>;
    /// Number of steps across all namespaces of a session.
    async fn count_steps(&self, session_id: &str) -> StorageResult<u64>;
    /// Search steps, oldest first.
    async fn search_steps(&self, query: &StepQuery) -> StorageResult<Vec<Step>>;
    /// Namespaces present in a session, main line first.
    async fn list_branches(&self, session_id: &str) -> StorageResult<Vec<BranchInfo>>;
    /// Delete every step of a session. Returns the number removed.
    async fn delete_session_steps(&self, session_id: &str) -> StorageResult<u64>;
}

/// Both stores behind one handle.
pub trait Storage: SessionStore + StepStore {}

impl<T: SessionStore + StepStore + ?Sized> Storage for T {}

/// Open the backend selected in configuration.
pub async fn open_storage(config: &DatabaseConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStorage::new(config).await?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
    }
}
