//! Crate-wide error type.
//!
//! Every failure that crosses a component boundary is a `BridgeError`. The
//! variants follow the taxonomy the host cares about: configuration, process
//! lifecycle, transport, protocol and execution failures. Messages are meant to
//! be shown to users as-is and carry the id of whatever they relate to.

use uuid::Uuid;

use crate::mcp::jsonrpc;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process {server_id} is already running")]
    AlreadyRunning { server_id: Uuid },

    #[error("Process {server_id} is not running")]
    NotRunning { server_id: Uuid },

    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Request {request_id} aborted: not connected")]
    Aborted { request_id: String },

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution timeout")]
    ExecutionTimeout { execution_id: Uuid },

    #[error("{message}")]
    Execution { execution_id: Uuid, message: String },

    #[error("No executor attached to handle tool '{0}'")]
    NoExecutor(String),

    #[error("Failed to bind MCP server on port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// JSON-RPC error code used when this error is reported to an MCP client.
    pub fn rpc_code(&self) -> i64 {
        match self {
            BridgeError::ToolNotFound(_) => jsonrpc::INVALID_PARAMS,
            BridgeError::Rpc { code, .. } => *code,
            _ => jsonrpc::INTERNAL_ERROR,
        }
    }

    /// Machine-readable kind, used in `error` event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::AlreadyRunning { .. }
            | BridgeError::NotRunning { .. }
            | BridgeError::Spawn { .. } => "process",
            BridgeError::NotConnected
            | BridgeError::Aborted { .. }
            | BridgeError::Timeout { .. }
            | BridgeError::Transport(_) => "transport",
            BridgeError::Protocol(_) | BridgeError::Rpc { .. } => "protocol",
            BridgeError::ToolNotFound(_)
            | BridgeError::ExecutionTimeout { .. }
            | BridgeError::Execution { .. }
            | BridgeError::NoExecutor(_) => "execution",
            BridgeError::Bind { .. } => "server",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_not_found_maps_to_invalid_params() {
        let err = BridgeError::ToolNotFound("echo".into());
        assert_eq!(err.rpc_code(), -32602);
        assert_eq!(err.to_string(), "Tool not found: echo");
    }

    #[test]
    fn execution_failures_map_to_internal_error() {
        let id = Uuid::new_v4();
        assert_eq!(BridgeError::ExecutionTimeout { execution_id: id }.rpc_code(), -32603);
        assert_eq!(
            BridgeError::ExecutionTimeout { execution_id: id }.to_string(),
            "Tool execution timeout"
        );
        let failed = BridgeError::Execution { execution_id: id, message: "boom".into() };
        assert_eq!(failed.to_string(), "boom");
        assert_eq!(failed.kind(), "execution");
    }

    #[test]
    fn remote_rpc_errors_keep_their_code() {
        let err = BridgeError::Rpc { code: -32601, message: "Method not found: x".into() };
        assert_eq!(err.rpc_code(), -32601);
        assert_eq!(err.kind(), "protocol");
    }
}
