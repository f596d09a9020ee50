//! In-process MCP bridge.
//!
//! The agent talks to host tool servers by wrapping JSON-RPC messages in
//! `mcp_message` control requests.  Only the methods a tools-only server
//! needs are routed here; anything else is answered with "method not found".

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::control::registry::{run_guarded, HandlerRegistry, Tool, ToolServer};
use crate::models::tool::ToolContext;
use crate::AppError;

/// MCP protocol revision reported by `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC "internal error".
pub const INTERNAL_ERROR: i64 = -32603;

/// Answer one JSON-RPC `message` addressed to `server_name`.
///
/// Always returns a JSON-RPC response object; failures are encoded as
/// JSON-RPC errors rather than surfaced as control errors.
pub async fn handle_message(
    registry: &HandlerRegistry,
    server_name: &str,
    message: &Value,
    ctx: ToolContext,
) -> Value {
    let id = message.get("id").cloned().unwrap_or(Value::Null);
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");

    let Some(server) = registry.server(server_name) else {
        warn!(server_name, method, "mcp: message for unknown server");
        return rpc_error(&id, METHOD_NOT_FOUND, &format!("Server '{server_name}' not found"));
    };

    debug!(server_name, method, "mcp: routing message");
    match method {
        "initialize" => rpc_result(
            &id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": server.name, "version": server.version },
            }),
        ),
        "notifications/initialized" => json!({ "jsonrpc": "2.0", "result": {} }),
        "tools/list" => {
            let tools: Vec<Value> = server.tools.iter().map(Tool::descriptor).collect();
            rpc_result(&id, json!({ "tools": tools }))
        }
        "tools/call" => match call_tool(server, message.get("params"), ctx).await {
            Ok(result) => rpc_result(&id, result),
            Err(err) => rpc_error(&id, INTERNAL_ERROR, &err.to_string()),
        },
        other => rpc_error(&id, METHOD_NOT_FOUND, &format!("Method '{other}' not found")),
    }
}

async fn call_tool(
    server: &ToolServer,
    params: Option<&Value>,
    ctx: ToolContext,
) -> crate::Result<Value> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::ProtocolViolation("tools/call without `params.name`".into()))?;
    let arguments = params
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    let tool = server.find(name).ok_or_else(|| {
        AppError::HandlerFailure(format!("tool '{name}' not found on server '{}'", server.name))
    })?;

    let handler = tool.handler.clone();
    let output = run_guarded(&format!("tool '{name}'"), async move {
        handler.call(arguments, ctx).await
    })
    .await?;

    Ok(output.to_value())
}

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
