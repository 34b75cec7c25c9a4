//! Unit tests for MCP protocol implementation.
//!
//! Tests JSON-RPC 2.0 request/response handling, tool definitions,
//! and request dispatch through `McpServer::handle_request`.

use super::*;
use crate::config::Config;
use crate::engine::PROGRESSIVE_TOOLS;
use crate::server::AppState;
use crate::storage::MemoryStorage;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn test_server() -> McpServer {
    let state = AppState::new(Config::default(), Arc::new(MemoryStorage::new()));
    McpServer::new(Arc::new(state))
}

fn request(id: Option<Value>, method: &str, params: Option<Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id,
        method: method.to_string(),
        params,
    }
}

fn find_tool(name: &str) -> Tool {
    tool_definitions()
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("tool {} not defined", name))
}

// ============================================================================
// JsonRpcResponse tests
// ============================================================================

#[test]
fn test_jsonrpc_response_success_with_id() {
    let response = JsonRpcResponse::success(Some(json!(1)), json!({"result": "ok"}));

    assert_eq!(response.jsonrpc, "2.0");
    assert_eq!(response.id, json!(1));
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["result"], "ok");
}

#[test]
fn test_jsonrpc_response_success_without_id() {
    let response = JsonRpcResponse::success(None, json!({"data": "value"}));
    assert_eq!(response.id, Value::Null);
}

#[test]
fn test_jsonrpc_response_error() {
    let response = JsonRpcResponse::error(Some(json!(42)), -32600, "Invalid request");

    assert!(response.result.is_none());
    let error = response.error.unwrap();
    assert_eq!(error.code, -32600);
    assert_eq!(error.message, "Invalid request");
}

#[test]
fn test_jsonrpc_response_serialization_omits_empty_side() {
    let ok = serde_json::to_string(&JsonRpcResponse::success(Some(json!(1)), json!({}))).unwrap();
    assert!(ok.contains("\"result\""));
    assert!(!ok.contains("\"error\""));

    let err = serde_json::to_string(&JsonRpcResponse::error(Some(json!(1)), -32601, "x")).unwrap();
    assert!(err.contains("-32601"));
    assert!(!err.contains("\"result\""));
}

// ============================================================================
// JsonRpcRequest / ToolCallParams deserialization tests
// ============================================================================

#[test]
fn test_jsonrpc_request_deserialization() {
    let json_str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
    let request: JsonRpcRequest = serde_json::from_str(json_str).unwrap();

    assert_eq!(request.id, Some(json!(1)));
    assert_eq!(request.method, "initialize");
    assert!(request.params.is_some());
}

#[test]
fn test_jsonrpc_notification_no_id() {
    let json_str = r#"{"jsonrpc":"2.0","method":"initialized"}"#;
    let request: JsonRpcRequest = serde_json::from_str(json_str).unwrap();

    assert!(request.id.is_none());
    assert!(request.params.is_none());
}

#[test]
fn test_jsonrpc_request_missing_method_field() {
    let json_str = r#"{"jsonrpc":"2.0","id":1}"#;
    assert!(serde_json::from_str::<JsonRpcRequest>(json_str).is_err());
}

#[test]
fn test_tool_call_params_deserialization() {
    let params: ToolCallParams = serde_json::from_value(json!({
        "name": "sequential_thinking",
        "arguments": {"content": "x", "total_steps": 1}
    }))
    .unwrap();

    assert_eq!(params.name, "sequential_thinking");
    assert_eq!(params.arguments.unwrap()["total_steps"], 1);
}

// ============================================================================
// Tool definitions
// ============================================================================

#[test]
fn test_tool_names_are_unique() {
    let tools = tool_definitions();
    let names: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names.len(), tools.len());
}

#[test]
fn test_all_tools_count() {
    assert_eq!(tool_definitions().len(), 12);
}

#[test]
fn test_progressive_tools_are_advertised_first() {
    let tools = tool_definitions();
    let names: Vec<&str> = tools.iter().take(5).map(|t| t.name.as_str()).collect();
    assert_eq!(names, PROGRESSIVE_TOOLS.to_vec());
}

#[test]
fn test_progressive_tools_share_schema() {
    let expected = progressive_step_schema();
    for name in PROGRESSIVE_TOOLS {
        let tool = find_tool(name);
        assert_eq!(tool.input_schema, expected, "schema mismatch for {}", name);
    }

    let required = expected["required"].as_array().unwrap();
    assert_eq!(required, &vec![json!("content"), json!("total_steps")]);
    assert_eq!(expected["properties"]["step_number"]["minimum"], 1);
}

#[test]
fn test_all_tools_have_object_schemas() {
    for tool in tool_definitions() {
        assert!(!tool.description.is_empty(), "{} has no description", tool.name);
        assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
        assert!(tool.input_schema["properties"].is_object(), "{}", tool.name);
        assert_eq!(
            tool.input_schema["additionalProperties"], false,
            "{} should reject unknown properties",
            tool.name
        );
    }
}

#[test]
fn test_session_tools_require_session_id() {
    for name in ["session_get", "session_summary", "session_delete", "session_clear_steps"] {
        let tool = find_tool(name);
        assert_eq!(tool.input_schema["required"], json!(["session_id"]), "{}", name);
    }
}

#[test]
fn test_step_search_lists_every_step_type() {
    let tool = find_tool("step_search");
    let values = tool.input_schema["properties"]["step_type"]["enum"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(values, crate::storage::StepType::ALL.len());
}

#[test]
fn test_tool_serialization_uses_input_schema_name() {
    let value = serde_json::to_value(find_tool("session_list")).unwrap();
    assert!(value.get("inputSchema").is_some());
    assert!(value.get("input_schema").is_none());
}

#[test]
fn test_tool_call_result_serialization() {
    let result = ToolCallResult {
        content: vec![ToolResultContent {
            content_type: "text".to_string(),
            text: "hello".to_string(),
        }],
        is_error: None,
    };
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["content"][0]["type"], "text");
    assert!(value.get("isError").is_none());
}

// ============================================================================
// Request dispatch
// ============================================================================

#[tokio::test]
async fn test_initialize() {
    let response = test_server()
        .handle_request(request(Some(json!(1)), "initialize", Some(json!({}))))
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
    assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let server = test_server();
    assert!(server
        .handle_request(request(None, "initialized", None))
        .await
        .is_none());
    assert!(server
        .handle_request(request(None, "notifications/unknown", None))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unknown_method() {
    let response = test_server()
        .handle_request(request(Some(json!(7)), "resources/list", None))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32601);
}

#[tokio::test]
async fn test_tools_list() {
    let response = test_server()
        .handle_request(request(Some(json!(2)), "tools/list", None))
        .await
        .unwrap();
    let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
    assert_eq!(tools, tool_definitions().len());
}

#[tokio::test]
async fn test_tools_call_missing_params() {
    let response = test_server()
        .handle_request(request(Some(json!(3)), "tools/call", None))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32602);
}

#[tokio::test]
async fn test_tools_call_flags_step_errors() {
    let server = test_server();
    let call = |id: i64| {
        request(
            Some(json!(id)),
            "tools/call",
            Some(json!({
                "name": "sequential_thinking",
                "arguments": {
                    "session_id": "s1",
                    "content": "Start",
                    "step_number": 1,
                    "total_steps": 3
                }
            })),
        )
    };

    let first = server.handle_request(call(1)).await.unwrap().result.unwrap();
    assert!(first.get("isError").is_none());
    let text = first["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["status"], "success");

    let second = server.handle_request(call(2)).await.unwrap().result.unwrap();
    assert_eq!(second["isError"], true);
    assert!(second["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("conflict"));
}

#[tokio::test]
async fn test_tools_call_unknown_tool_is_error_result() {
    let response = test_server()
        .handle_request(request(
            Some(json!(4)),
            "tools/call",
            Some(json!({"name": "nonexistent", "arguments": {}})),
        ))
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["isError"], true);
    assert!(result["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("Unknown tool: nonexistent"));
}
