//! MCP protocol implementation for JSON-RPC 2.0 communication.
//!
//! Requests arrive one per line on stdin and responses leave one per line on
//! stdout. Logging goes to stderr so the frame stream stays clean.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "progressive-reasoning";

/// MCP protocol revision implemented by this server.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier, `null` when the request could not be read.
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP server information returned during initialization.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// The server name identifier.
    pub name: String,
    /// The server version string.
    pub version: String,
}

/// MCP server capabilities advertised to clients.
#[derive(Debug, Serialize)]
pub struct Capabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change dynamically.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the MCP initialize handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    /// The MCP protocol version supported.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: Capabilities,
    /// Server identification information.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Unique tool name (used in tool calls).
    pub name: String,
    /// Human-readable description of the tool.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    /// The content type (e.g., "text").
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text content of the result.
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// The result content items.
    pub content: Vec<ToolResultContent>,
    /// Whether the result represents an error.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// MCP Server running over stdio.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the server using async stdio until stdin closes
    pub async fn run(&self) -> std::io::Result<()> {
        info!(server = SERVER_NAME, "MCP server starting");

        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    Some(JsonRpcResponse::error(
                        None,
                        -32700,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            // Notifications get no response
            if let Some(response) = response {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                stdout.write_all(response_json.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        Ok(())
    }

    /// Handle a single JSON-RPC request.
    ///
    /// Returns `None` for notifications (requests without an id).
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" | "notifications/initialized" => {
                debug!("Received initialized notification");
                None
            }
            "notifications/cancelled" => {
                debug!("Received cancelled notification");
                None
            }
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "tools/call" => Some(self.handle_tool_call(request.id, request.params).await),
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    Some(JsonRpcResponse::error(
                        request.id,
                        -32601,
                        format!("Method not found: {}", method),
                    ))
                }
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }

    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        debug!("Handling tools/list request");
        JsonRpcResponse::success(id, json!({ "tools": tool_definitions() }))
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(p) => p,
                Err(e) => {
                    return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e));
                }
            },
            None => {
                return JsonRpcResponse::error(id, -32602, "Missing params");
            }
        };

        info!(tool = %params.name, "Handling tool call");

        let (content, is_error) =
            match handle_tool_call(&self.state, &params.name, params.arguments).await {
                Ok(result) => {
                    // Step failures are folded into the payload; surface them to the client too.
                    let failed = result.get("status").and_then(Value::as_str) == Some("error");
                    let text = serde_json::to_string_pretty(&result).unwrap_or_else(|e| {
                        error!(error = %e, "Failed to serialize tool result");
                        format!("{{\"error\": \"Serialization failed: {}\"}}", e)
                    });
                    (
                        ToolResultContent {
                            content_type: "text".to_string(),
                            text,
                        },
                        failed.then_some(true),
                    )
                }
                Err(e) => (
                    ToolResultContent {
                        content_type: "text".to_string(),
                        text: format!("Error: {}", e),
                    },
                    Some(true),
                ),
            };

        let tool_result = ToolCallResult {
            content: vec![content],
            is_error,
        };

        match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize tool call result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }
}

/// Every tool advertised by `tools/list`, progressive tools first.
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        get_sequential_thinking_tool(),
        get_debugging_approach_tool(),
        get_mental_model_tool(),
        get_collaborative_reasoning_tool(),
        get_decision_framework_tool(),
        get_session_get_tool(),
        get_session_list_tool(),
        get_session_summary_tool(),
        get_session_delete_tool(),
        get_session_clear_steps_tool(),
        get_session_cleanup_tool(),
        get_step_search_tool(),
    ]
}

/// Input schema shared by every progressive tool.
fn progressive_step_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": {
                "type": "string",
                "description": "Session to continue; a new session is created when omitted"
            },
            "content": {
                "type": "string",
                "description": "The content of this reasoning step"
            },
            "step_number": {
                "type": "integer",
                "minimum": 1,
                "description": "Position within the branch (defaults to the next number)"
            },
            "total_steps": {
                "type": "integer",
                "minimum": 1,
                "description": "Expected total number of steps; may only grow"
            },
            "next_step_needed": {
                "type": "boolean",
                "description": "Whether more steps will follow (default: true)"
            },
            "is_revision": {
                "type": "boolean",
                "description": "Whether this step revises an earlier one"
            },
            "revises_step": {
                "type": "integer",
                "minimum": 1,
                "description": "Step number being revised in the same branch"
            },
            "branch_from_step": {
                "type": "integer",
                "minimum": 1,
                "description": "Step in the parent branch this new branch forks from"
            },
            "branch_id": {
                "type": "string",
                "description": "Branch to write to; omit for the main line"
            },
            "parent_branch_id": {
                "type": "string",
                "description": "Branch the new branch forks from; omit to fork from the main line"
            },
            "needs_more_steps": {
                "type": "boolean",
                "description": "Allow step_number to exceed total_steps, raising the total"
            },
            "metadata": {
                "type": "object",
                "description": "Arbitrary metadata stored with the step"
            }
        },
        "required": ["content", "total_steps"],
        "additionalProperties": false
    })
}

fn progressive_tool(name: &str, description: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: progressive_step_schema(),
    }
}

fn get_sequential_thinking_tool() -> Tool {
    progressive_tool(
        "sequential_thinking",
        "Step-by-step reasoning with persisted state. Submit one step per call; steps can be revised or branched.",
    )
}

fn get_debugging_approach_tool() -> Tool {
    progressive_tool(
        "debugging_approach",
        "Progressive debugging: hypotheses, evidence and fixes recorded one step at a time, with evidence and risks extracted from each step.",
    )
}

fn get_mental_model_tool() -> Tool {
    progressive_tool(
        "mental_model",
        "Apply a mental model (first principles, inversion, second-order thinking) progressively across steps.",
    )
}

fn get_collaborative_reasoning_tool() -> Tool {
    progressive_tool(
        "collaborative_reasoning",
        "Multi-perspective reasoning recorded step by step, tracking proposals, objections and consensus.",
    )
}

fn get_decision_framework_tool() -> Tool {
    progressive_tool(
        "decision_framework",
        "Structured decision making one step at a time: options, criteria, scoring and a final recommendation.",
    )
}

fn get_session_get_tool() -> Tool {
    Tool {
        name: "session_get".to_string(),
        description: "Get a session with its steps. Defaults to the main line.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Session to read"
                },
                "branch_id": {
                    "type": "string",
                    "description": "Only steps of this branch"
                },
                "all_branches": {
                    "type": "boolean",
                    "description": "Steps of every branch, main line first"
                },
                "resolve_revisions": {
                    "type": "boolean",
                    "description": "Show only the latest step for each logical position"
                }
            },
            "required": ["session_id"],
            "additionalProperties": false
        }),
    }
}

fn get_session_list_tool() -> Tool {
    Tool {
        name: "session_list".to_string(),
        description: "List sessions, newest first.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "tool_name": {
                    "type": "string",
                    "description": "Only sessions driven by this tool"
                },
                "active": {
                    "type": "boolean",
                    "description": "Only sessions with this active flag"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of sessions"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Number of sessions to skip"
                }
            },
            "additionalProperties": false
        }),
    }
}

fn get_session_summary_tool() -> Tool {
    Tool {
        name: "session_summary".to_string(),
        description: "Summarize a session: step counts and latest step per branch, and whether the main line is complete.".to_string(),
        input_schema: session_id_schema("Session to summarize"),
    }
}

fn get_session_delete_tool() -> Tool {
    Tool {
        name: "session_delete".to_string(),
        description: "Delete a session and all of its steps.".to_string(),
        input_schema: session_id_schema("Session to delete"),
    }
}

fn get_session_clear_steps_tool() -> Tool {
    Tool {
        name: "session_clear_steps".to_string(),
        description: "Delete every step of a session while keeping the session.".to_string(),
        input_schema: session_id_schema("Session whose steps are deleted"),
    }
}

fn get_session_cleanup_tool() -> Tool {
    Tool {
        name: "session_cleanup".to_string(),
        description: "Delete sessions not updated within the given number of hours.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "older_than_hours": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Age threshold in hours (defaults to SESSION_MAX_AGE_HOURS)"
                }
            },
            "additionalProperties": false
        }),
    }
}

fn get_step_search_tool() -> Tool {
    Tool {
        name: "step_search".to_string(),
        description: "Search steps by session, text, step type and minimum confidence.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Restrict to one session"
                },
                "text": {
                    "type": "string",
                    "description": "Case-insensitive substring of the step content"
                },
                "step_type": {
                    "type": "string",
                    "enum": [
                        "decomposition",
                        "hypothesis",
                        "evidence_gathering",
                        "pattern_recognition",
                        "logical_deduction",
                        "synthesis",
                        "validation",
                        "conclusion"
                    ],
                    "description": "Exact step type"
                },
                "min_confidence": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1,
                    "description": "Minimum confidence, inclusive"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of results"
                }
            },
            "additionalProperties": false
        }),
    }
}

fn session_id_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": {
                "type": "string",
                "description": description
            }
        },
        "required": ["session_id"],
        "additionalProperties": false
    })
}
