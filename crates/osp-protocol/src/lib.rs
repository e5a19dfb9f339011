// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-protocol
#![deny(unsafe_code)]

pub mod catalog;

pub use catalog::{catalog, ToolDescriptor};

use osp_error::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Schema version reported by the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Errors from wire framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line is not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The object is not a JSON-RPC 2.0 request.
    #[error("not a json-rpc 2.0 request: {reason}")]
    InvalidRequest {
        /// What was wrong with the object.
        reason: String,
    },
}

/// One incoming JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be `"2.0"`.
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Whether this request expects no response.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Wire-level JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Structured data (stable code, hint, details).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&ToolError> for JsonRpcError {
    fn from(err: &ToolError) -> Self {
        Self {
            code: err.jsonrpc_code(),
            message: err.to_string(),
            data: Some(json!({
                "code": err.code.as_str(),
                "kind": err.kind,
                "hint": err.hint,
                "details": err.details,
            })),
        }
    }
}

/// Line codec for the stdio channel.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec;

impl LineCodec {
    /// Decode one line into a request.
    ///
    /// # Errors
    ///
    /// [`ProtocolError`] on malformed JSON or a non-2.0 request shape.
    pub fn decode(line: &str) -> Result<JsonRpcRequest, ProtocolError> {
        let request: JsonRpcRequest = serde_json::from_str(line.trim())?;
        if request.jsonrpc != "2.0" {
            return Err(ProtocolError::InvalidRequest {
                reason: format!("jsonrpc must be \"2.0\", got {:?}", request.jsonrpc),
            });
        }
        if request.method.is_empty() {
            return Err(ProtocolError::InvalidRequest {
                reason: "method must not be empty".into(),
            });
        }
        Ok(request)
    }

    /// Encode a success response as one newline-terminated line.
    #[must_use]
    pub fn encode_result(id: &Value, result: Value) -> String {
        let mut line = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
        line.push('\n');
        line
    }

    /// Encode an error response as one newline-terminated line.
    #[must_use]
    pub fn encode_error(id: &Value, error: &JsonRpcError) -> String {
        let mut line = json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string();
        line.push('\n');
        line
    }
}

/// Wrap a tool envelope as `tools/call` result content.
#[must_use]
pub fn tool_call_content(envelope_json: String) -> Value {
    json!({"content": [{"type": "text", "text": envelope_json}]})
}

/// The `initialize` handshake result.
#[must_use]
pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "opsplane", "version": env!("CARGO_PKG_VERSION")},
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use osp_error::ErrorCode;

    #[test]
    fn decode_valid_request() {
        let request = LineCodec::decode(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"help"}}"#,
        )
        .unwrap();
        assert_eq!(request.method, "tools/call");
        assert_eq!(request.id, Some(json!(1)));
        assert!(!request.is_notification());
    }

    #[test]
    fn notifications_have_no_id() {
        let request =
            LineCodec::decode(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(request.is_notification());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let err = LineCodec::decode(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest { .. }));
    }

    #[test]
    fn garbage_is_invalid_json() {
        let err = LineCodec::decode("not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn responses_are_single_lines() {
        let line = LineCodec::encode_result(&json!(7), json!({"ok": true}));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["result"]["ok"], true);
    }

    #[test]
    fn tool_error_maps_to_jsonrpc_error() {
        let err = ToolError::new(ErrorCode::ApplyRequired, "needs apply").with_hint("pass apply");
        let rpc = JsonRpcError::from(&err);
        assert_eq!(rpc.code, -32003);
        assert!(rpc.message.contains("APPLY_REQUIRED"));
        let data = rpc.data.unwrap();
        assert_eq!(data["code"], "APPLY_REQUIRED");
        assert_eq!(data["kind"], "denied");
        assert_eq!(data["hint"], "pass apply");
    }

    #[test]
    fn invalid_params_uses_standard_code() {
        let err = ToolError::new(ErrorCode::MissingInputs, "missing");
        assert_eq!(JsonRpcError::from(&err).code, -32602);
    }

    #[test]
    fn tool_call_content_shape() {
        let content = tool_call_content("{\"ok\":true}".into());
        assert_eq!(content["content"][0]["type"], "text");
        assert_eq!(content["content"][0]["text"], "{\"ok\":true}");
    }

    #[test]
    fn initialize_reports_schema_version() {
        let init = initialize_result();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["serverInfo"]["name"], "opsplane");
    }
}
