//! JSON-RPC 2.0 envelopes shared by the client and the server.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Protocol version announced by both sides of the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Outbound request envelope: `{jsonrpc, id, method, params}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// `{code, message, data?}` as carried in an error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub fn success_response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// Normalized correlation key for a JSON-RPC id.
///
/// Numbers and strings are both accepted so that a reply echoing `"7"` still
/// matches request `7`. `null`, objects and arrays are not valid ids.
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Split a reply envelope into its `result` or its `error`.
pub fn into_result(response: Value) -> Result<Value, JsonRpcError> {
    if let Some(err) = response.get("error") {
        let parsed = serde_json::from_value::<JsonRpcError>(err.clone()).unwrap_or_else(|_| {
            JsonRpcError {
                code: INTERNAL_ERROR,
                message: err.to_string(),
                data: None,
            }
        });
        return Err(parsed);
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}
