use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::SharedState;
use crate::engine::{ProgressiveStepRequest, StepView, PROGRESSIVE_TOOLS};
use crate::error::{McpError, McpResult};
use crate::storage::{SessionFilter, StepQuery};

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        name if PROGRESSIVE_TOOLS.contains(&name) => {
            handle_progressive_step(state, name, arguments).await
        }
        "session_get" => handle_session_get(state, arguments).await,
        "session_list" => handle_session_list(state, arguments).await,
        "session_summary" => handle_session_summary(state, arguments).await,
        "session_delete" => handle_session_delete(state, arguments).await,
        "session_clear_steps" => handle_session_clear_steps(state, arguments).await,
        "session_cleanup" => handle_session_cleanup(state, arguments).await,
        "step_search" => handle_step_search(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Submit one step of a progressive tool. Engine errors are part of the
/// response, so only argument errors fail the call.
async fn handle_progressive_step(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    let request: ProgressiveStepRequest = parse_arguments(tool_name, arguments)?;
    let response = state.orchestrator.submit_step(tool_name, request).await;
    serde_json::to_value(response).map_err(McpError::Json)
}

#[derive(Debug, Deserialize)]
struct SessionIdParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionGetParams {
    session_id: String,
    #[serde(flatten)]
    view: StepView,
}

async fn handle_session_get(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("session_get", arguments, |params: SessionGetParams| async move {
        state
            .orchestrator
            .get_session(&params.session_id, &params.view)
            .await
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct SessionListParams {
    #[serde(flatten)]
    filter: SessionFilter,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: u32,
}

async fn handle_session_list(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionListParams =
        parse_optional_arguments("session_list", arguments)?.unwrap_or_default();

    let sessions = state
        .orchestrator
        .list_sessions(&params.filter, params.limit, params.offset)
        .await?;

    Ok(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn handle_session_summary(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("session_summary", arguments, |params: SessionIdParams| async move {
        state.orchestrator.summarize_session(&params.session_id).await
    })
    .await
}

#[derive(Debug, Serialize)]
struct DeleteResult {
    session_id: String,
    deleted: bool,
}

async fn handle_session_delete(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("session_delete", arguments, |params: SessionIdParams| async move {
        let deleted = state.orchestrator.delete_session(&params.session_id).await?;
        Ok::<_, crate::error::EngineError>(DeleteResult {
            session_id: params.session_id,
            deleted,
        })
    })
    .await
}

async fn handle_session_clear_steps(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    let params: SessionIdParams = parse_arguments("session_clear_steps", arguments)?;
    let removed = state.orchestrator.clear_steps(&params.session_id).await?;

    Ok(json!({
        "session_id": params.session_id,
        "steps_removed": removed,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CleanupParams {
    #[serde(default)]
    older_than_hours: Option<u64>,
}

async fn handle_session_cleanup(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: CleanupParams =
        parse_optional_arguments("session_cleanup", arguments)?.unwrap_or_default();
    let removed = state.orchestrator.cleanup(params.older_than_hours).await?;

    Ok(json!({ "sessions_removed": removed }))
}

async fn handle_step_search(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let query: StepQuery =
        parse_optional_arguments("step_search", arguments)?.unwrap_or_default();
    let steps = state.orchestrator.search_steps(&query).await?;

    Ok(json!({
        "count": steps.len(),
        "steps": steps,
    }))
}

fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Like [`parse_arguments`] for tools whose arguments are all optional.
fn parse_optional_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Option<T>> {
    match arguments {
        None | Some(Value::Null) => Ok(None),
        Some(args) => parse_arguments(tool_name, Some(args)).map(Some),
    }
}

/// Parse arguments, run the operation and serialize its result.
///
/// Operation errors become `ExecutionFailed`.
async fn execute_handler<P, R, E, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: std::fmt::Display,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;

    serde_json::to_value(result).map_err(McpError::Json)
}
