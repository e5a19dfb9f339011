// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-RPC method dispatch.
//!
//! `initialize` and `tools/list` are answered directly; `tools/call` goes
//! through the execution envelope. The client-facing envelope carries the
//! canonical tool, action, trace block, and shaped result as one JSON text
//! content item.

use crate::AppState;
use osp_error::{ErrorCode, ToolError};
use osp_executor::Envelope;
use osp_protocol::{
    catalog, initialize_result, tool_call_content, JsonRpcError, JsonRpcRequest, LineCodec,
};
use serde_json::{json, Value};
use tracing::debug;

/// Handle one decoded request. Returns the encoded response line, or
/// `None` for notifications.
pub async fn handle_request(state: &AppState, request: JsonRpcRequest) -> Option<String> {
    let id = request.id.clone()?;
    debug!(target: "osp.server", method = %request.method, "dispatching request");

    let outcome = match request.method.as_str() {
        "initialize" => Ok(initialize_result()),
        "tools/list" => Ok(json!({"tools": catalog()})),
        "tools/call" => call_tool(state, request.params.unwrap_or(Value::Null)).await,
        other => {
            let rpc = JsonRpcError {
                code: -32601,
                message: format!("method '{other}' not found"),
                data: None,
            };
            return Some(LineCodec::encode_error(&id, &rpc));
        }
    };

    Some(match outcome {
        Ok(result) => LineCodec::encode_result(&id, result),
        Err(err) => LineCodec::encode_error(&id, &JsonRpcError::from(&err)),
    })
}

async fn call_tool(state: &AppState, params: Value) -> Result<Value, ToolError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::new(ErrorCode::MissingInputs, "'name' is required"))?;
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let envelope = state.executor.execute(name, arguments).await?;
    let text = serde_json::to_string(&client_envelope(envelope))?;
    Ok(tool_call_content(text))
}

/// Reshape the internal envelope into the client contract.
fn client_envelope(envelope: Envelope) -> Value {
    let mut out = json!({
        "ok": envelope.ok,
        "tool": envelope.meta.tool,
        "action": envelope.meta.action,
        "trace": {
            "trace_id": envelope.meta.trace_id,
            "span_id": envelope.meta.span_id,
            "parent_span_id": envelope.meta.parent_span_id,
        },
        "result": envelope.result,
    });
    if let Some(invoked_as) = &envelope.meta.invoked_as {
        out["invoked_as"] = json!(invoked_as);
    }
    if let Some(preset) = &envelope.meta.preset {
        out["preset"] = json!(preset);
    }
    // Artifact pointers produced by workspace runs surface at the top level
    // so clients need not dig through the result.
    for key in ["artifact_uri_context", "artifact_uri_json"] {
        if let Some(uri) = envelope.result.get(key) {
            out[key] = uri.clone();
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
