use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    BranchInfo, NewStep, Session, SessionFilter, SessionPatch, SessionStore, Step, StepQuery,
    StepStore,
};
use crate::error::{StorageError, StorageResult};

/// Steps of one `(session_id, branch_id)` namespace, ascending by step number.
type Namespace = (String, Option<String>);

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    steps: HashMap<Namespace, Vec<Step>>,
    last_step_id: i64,
}

impl MemoryState {
    fn session_steps<'a>(&'a self, session_id: &'a str) -> impl Iterator<Item = &'a Vec<Step>> {
        self.steps
            .iter()
            .filter(move |((sid, _), _)| sid == session_id)
            .map(|(_, steps)| steps)
    }

    fn remove_session_steps(&mut self, session_id: &str) -> u64 {
        let mut removed = 0;
        self.steps.retain(|(sid, _), steps| {
            if sid == session_id {
                removed += steps.len() as u64;
                false
            } else {
                true
            }
        });
        removed
    }
}

/// In-memory storage backend.
///
/// All state sits behind a single `RwLock`; every mutation that must be
/// atomic (session check-then-insert, step compare-and-insert) runs under one
/// write guard. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn namespace(session_id: &str, branch_id: Option<&str>) -> Namespace {
    (session_id.to_string(), branch_id.map(str::to_string))
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn create_session(&self, session: &Session) -> StorageResult<Session> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(StorageError::DuplicateSession {
                session_id: session.id.clone(),
            });
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(session.clone())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        Ok(self.state.read().await.sessions.get(id).cloned())
    }

    async fn get_or_create_session(&self, id: &str, tool_name: &str) -> StorageResult<Session> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %id, tool = %tool_name, "Creating session");
                Session::with_id(id, tool_name)
            })
            .clone();
        Ok(session)
    }

    async fn update_session(
        &self,
        id: &str,
        patch: &SessionPatch,
    ) -> StorageResult<Option<Session>> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(id) else {
            return Ok(None);
        };
        if let Some(metadata) = &patch.metadata {
            session.metadata = Some(metadata.clone());
        }
        if let Some(active) = patch.active {
            session.active = active;
        }
        session.updated_at = Utc::now().max(session.created_at);
        Ok(Some(session.clone()))
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> StorageResult<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        let existed = state.sessions.remove(id).is_some();
        state.remove_session_steps(id);
        Ok(existed)
    }

    async fn cleanup_older_than(&self, age: Duration) -> StorageResult<u64> {
        let cutoff = Utc::now() - age;
        let mut state = self.state.write().await;
        let stale: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.updated_at < cutoff)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            state.sessions.remove(id);
            state.remove_session_steps(id);
        }
        Ok(stale.len() as u64)
    }
}

#[async_trait]
impl StepStore for MemoryStorage {
    async fn save_step(&self, step: &NewStep) -> StorageResult<Step> {
        step.validate()?;

        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&step.session_id) {
            return Err(StorageError::SessionNotFound {
                session_id: step.session_id.clone(),
            });
        }

        let key = namespace(&step.session_id, step.branch_id.as_deref());
        let latest = state
            .steps
            .get(&key)
            .and_then(|steps| steps.last())
            .map(|s| s.step_number)
            .unwrap_or(0);
        if step.step_number <= latest {
            return Err(StorageError::StepConflict {
                session_id: step.session_id.clone(),
                branch_id: step.branch_id.clone(),
                step_number: step.step_number,
            });
        }

        state.last_step_id += 1;
        let now = Utc::now();
        let saved = Step::from_new(state.last_step_id, step, now);
        state.steps.entry(key).or_default().push(saved.clone());

        if let Some(session) = state.sessions.get_mut(&step.session_id) {
            session.updated_at = now.max(session.created_at);
        }

        Ok(saved)
    }

    async fn get_step_by_number(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
        step_number: u32,
    ) -> StorageResult<Option<Step>> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .get(&namespace(session_id, branch_id))
            .and_then(|steps| steps.iter().find(|s| s.step_number == step_number))
            .cloned())
    }

    async fn list_steps(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
    ) -> StorageResult<Vec<Step>> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .get(&namespace(session_id, branch_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_all_steps(&self, session_id: &str) -> StorageResult<Vec<Step>> {
        let state = self.state.read().await;
        let mut steps: Vec<Step> = state.session_steps(session_id).flatten().cloned().collect();
        steps.sort_by(|a, b| {
            a.branch_id
                .cmp(&b.branch_id)
                .then(a.step_number.cmp(&b.step_number))
        });
        Ok(steps)
    }

    async fn latest_step(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
    ) -> StorageResult<Option<Step>> {
        let state = self.state.read().await;
        Ok(state
            .steps
            .get(&namespace(session_id, branch_id))
            .and_then(|steps| steps.last())
            .cloned())
    }

    async fn count_steps(&self, session_id: &str) -> StorageResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .session_steps(session_id)
            .map(|steps| steps.len() as u64)
            .sum())
    }

    async fn search_steps(&self, query: &StepQuery) -> StorageResult<Vec<Step>> {
        let state = self.state.read().await;
        let mut steps: Vec<Step> = state
            .steps
            .values()
            .flatten()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.id);
        if let Some(limit) = query.limit {
            steps.truncate(limit as usize);
        }
        Ok(steps)
    }

    async fn list_branches(&self, session_id: &str) -> StorageResult<Vec<BranchInfo>> {
        let state = self.state.read().await;
        let mut branches: Vec<BranchInfo> = state
            .steps
            .iter()
            .filter(|((sid, _), steps)| sid == session_id && !steps.is_empty())
            .map(|((_, branch_id), steps)| BranchInfo {
                branch_id: branch_id.clone(),
                step_count: steps.len() as u64,
                latest_step_number: steps.last().map(|s| s.step_number).unwrap_or(0),
            })
            .collect();
        branches.sort_by(|a, b| a.branch_id.cmp(&b.branch_id));
        Ok(branches)
    }

    async fn delete_session_steps(&self, session_id: &str) -> StorageResult<u64> {
        Ok(self.state.write().await.remove_session_steps(session_id))
    }
}
