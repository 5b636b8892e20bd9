//! Execution bridge: turns a `tools/call` into an asynchronous round-trip with
//! an external executor (the flow that implements the tool).
//!
//! Each call publishes an `ExecutionRequest` on the executor channel and waits
//! for the `ExecutionResponse` carrying the same `executionId`, or for the
//! timeout. Both outcomes go through the shared `Correlator`, so exactly one
//! of them settles the call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::ToolDefinition;
use crate::correlation::{Correlator, Settled};
use crate::error::{BridgeError, BridgeResult};

/// Work handed to the external executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub execution_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
}

/// Reply from the external executor. Exactly one of `result` / `error` is
/// expected; a reply with neither counts as a `null` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: Uuid,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResponse {
    pub fn success(execution_id: Uuid, result: Value) -> Self {
        Self { execution_id, result: Some(result), error: None }
    }

    pub fn failure(execution_id: Uuid, message: impl Into<String>) -> Self {
        Self { execution_id, result: None, error: Some(message.into()) }
    }
}

type Outcome = Result<Value, String>;

#[derive(Clone)]
pub struct ExecutionBridge {
    pending: Arc<Correlator<Uuid, Outcome>>,
    requests: mpsc::UnboundedSender<ExecutionRequest>,
    timeout: Duration,
}

impl ExecutionBridge {
    /// Create a bridge and the receiving end the executor listens on.
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ExecutionRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(Correlator::new()),
                requests: tx,
                timeout,
            },
            rx,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run `tool` with `arguments` through the external executor.
    pub async fn execute_tool_flow(&self, tool: &ToolDefinition, arguments: Value) -> BridgeResult<Value> {
        let execution_id = Uuid::new_v4();
        let pending = self.pending.insert(execution_id);

        let request = ExecutionRequest {
            execution_id,
            tool_name: tool.name.clone(),
            arguments,
        };
        if self.requests.send(request).is_err() {
            return Err(BridgeError::NoExecutor(tool.name.clone()));
        }

        tracing::debug!(
            execution_id = %execution_id,
            tool = %tool.name,
            "bridge: execution requested"
        );

        match pending.wait(self.timeout).await {
            Settled::Resolved(Ok(value)) => Ok(value),
            Settled::Resolved(Err(message)) => Err(BridgeError::Execution { execution_id, message }),
            Settled::TimedOut => {
                tracing::warn!(
                    execution_id = %execution_id,
                    tool = %tool.name,
                    "bridge: execution timed out after {}ms",
                    self.timeout.as_millis()
                );
                Err(BridgeError::ExecutionTimeout { execution_id })
            }
            Settled::Dropped => Err(BridgeError::Execution {
                execution_id,
                message: "execution was abandoned".to_string(),
            }),
        }
    }

    /// Settle a pending execution. Returns `false` for unknown or already
    /// settled ids (late replies after a timeout land here).
    pub fn complete(&self, response: ExecutionResponse) -> bool {
        let outcome = match response.error {
            Some(message) => Err(message),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let settled = self.pending.resolve(&response.execution_id, outcome);
        if !settled {
            tracing::debug!(
                execution_id = %response.execution_id,
                "bridge: ignoring response for unknown or settled execution"
            );
        }
        settled
    }
}

/// Shape an executor result as MCP `tools/call` content.
pub fn to_tool_result(value: Value) -> Value {
    if value.get("content").is_some_and(Value::is_array) {
        return value;
    }
    let text = match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::registry::ToolRegistry;

    fn tool(name: &str) -> ToolDefinition {
        ToolRegistry::new().register(name, "test tool", None, None)
    }

    #[tokio::test]
    async fn correlated_response_resolves_call() {
        let (bridge, mut rx) = ExecutionBridge::new(Duration::from_secs(5));
        let executor = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let req = rx.recv().await.unwrap();
                assert_eq!(req.tool_name, "echo");
                bridge.complete(ExecutionResponse::success(req.execution_id, req.arguments))
            })
        };

        let out = bridge.execute_tool_flow(&tool("echo"), json!({"msg": "hi"})).await.unwrap();
        assert_eq!(out, json!({"msg": "hi"}));
        assert!(executor.await.unwrap());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn executor_error_becomes_execution_error() {
        let (bridge, mut rx) = ExecutionBridge::new(Duration::from_secs(5));
        let b = bridge.clone();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            b.complete(ExecutionResponse::failure(req.execution_id, "flow failed"));
        });

        let err = bridge.execute_tool_flow(&tool("t"), json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref message, .. } if message == "flow failed"));
    }

    #[tokio::test]
    async fn timeout_wins_and_late_response_is_ignored() {
        let (bridge, mut rx) = ExecutionBridge::new(Duration::from_millis(30));
        let err = bridge.execute_tool_flow(&tool("slow"), json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::ExecutionTimeout { .. }));
        assert_eq!(err.to_string(), "Tool execution timeout");

        let req = rx.recv().await.unwrap();
        assert!(!bridge.complete(ExecutionResponse::success(req.execution_id, json!(1))));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_releases_its_execution() {
        let (bridge, mut rx) = ExecutionBridge::new(Duration::from_millis(50));
        let caller = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.execute_tool_flow(&tool("slow"), json!({})).await })
        };
        let req = rx.recv().await.unwrap();
        assert_eq!(bridge.pending_count(), 1);

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(bridge.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bridge.pending_count(), 0);
        assert!(!bridge.complete(ExecutionResponse::success(req.execution_id, json!(1))));
    }

    #[tokio::test]
    async fn missing_executor_fails_fast() {
        let (bridge, rx) = ExecutionBridge::new(Duration::from_secs(5));
        drop(rx);
        let err = bridge.execute_tool_flow(&tool("orphan"), json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::NoExecutor(ref n) if n == "orphan"));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn tool_result_wraps_plain_values() {
        assert_eq!(
            to_tool_result(json!("done")),
            json!({"content": [{"type": "text", "text": "done"}], "isError": false})
        );
        assert_eq!(
            to_tool_result(json!({"sum": 3})),
            json!({"content": [{"type": "text", "text": "{\"sum\":3}"}], "isError": false})
        );
        let already = json!({"content": [{"type": "text", "text": "x"}]});
        assert_eq!(to_tool_result(already.clone()), already);
    }

    #[test]
    fn response_deserializes_from_host_json() {
        let id = Uuid::new_v4();
        let resp: ExecutionResponse =
            serde_json::from_value(json!({"executionId": id, "error": "nope"})).unwrap();
        assert_eq!(resp.execution_id, id);
        assert_eq!(resp.error.as_deref(), Some("nope"));
        assert!(resp.result.is_none());
    }
}
