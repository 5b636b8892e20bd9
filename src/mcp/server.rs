//! MCP Server: exposes the tool registry as an MCP endpoint.
//!
//! Routes (see `create_router`):
//! - `GET /health` - liveness + tool count
//! - `POST /mcp` - JSON-RPC 2.0 dispatch
//! - `GET /sse` - event stream (`connected`, then periodic `heartbeat`)
//!
//! Supported methods:
//! - `initialize` - server info + capabilities
//! - `tools/list` - registry snapshot
//! - `tools/call` - run a registered tool through the execution bridge
//! - `<name>_tool` - shorthand for `tools/call` with `params` as arguments

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures_util::{FutureExt, Stream};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::bridge::{to_tool_result, ExecutionBridge};
use super::jsonrpc::{
    error_response, success_response, INTERNAL_ERROR, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use super::registry::ToolRegistry;
use crate::config::ServerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventSink, Topic};
use crate::state::AppState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── Handlers ────────────────────────────────────────────────────────────────

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "server": state.server_name,
        "uptime": state.uptime_secs(),
        "toolCount": state.registry.len(),
    }))
}

/// MCP JSON-RPC 2.0 endpoint handler.
///
/// The body is taken raw so that malformed JSON still gets a JSON-RPC reply
/// instead of an extractor rejection.
pub async fn mcp_handler(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("MCP server: unparsable request body: {}", e);
            return Json(error_response(&Value::Null, PARSE_ERROR, "Parse error"));
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    match AssertUnwindSafe(dispatch(&state, &request)).catch_unwind().await {
        Ok(response) => Json(response),
        Err(_) => {
            tracing::error!(id = %id, "MCP server: dispatch panicked");
            Json(error_response(&id, INTERNAL_ERROR, "Internal error"))
        }
    }
}

pub async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!("MCP server: event stream opened");
    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(
            Event::default()
                .event("connected")
                .json_data(json!({ "server": state.server_name, "timestamp": chrono::Utc::now() }))
                .unwrap_or_default(),
        );

        let period = state.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            let closing = tokio::select! {
                _ = state.shutdown.cancelled() => true,
                _ = ticker.tick() => false,
            };
            if closing {
                break;
            }
            yield Ok(
                Event::default()
                    .event("heartbeat")
                    .json_data(json!({ "timestamp": chrono::Utc::now() }))
                    .unwrap_or_default(),
            );
        }
    };
    Sse::new(stream)
}

// ── Dispatch ────────────────────────────────────────────────────────────────

async fn dispatch(state: &AppState, request: &Value) -> Value {
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    tracing::debug!(method = %method, "MCP server: incoming request");

    match method {
        "initialize" => success_response(&id, handle_initialize(state)),
        "tools/list" => success_response(&id, handle_tools_list(state)),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            call_tool(state, &id, name, arguments).await
        }
        m if m.ends_with("_tool") => call_tool(state, &id, m, params).await,
        _ => error_response(&id, METHOD_NOT_FOUND, &format!("Method not found: {}", method)),
    }
}

fn handle_initialize(state: &AppState) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": state.server_name,
            "version": state.version,
        }
    })
}

fn handle_tools_list(state: &AppState) -> Value {
    let tools: Vec<Value> = state.registry.list().iter().map(|t| t.to_mcp()).collect();
    json!({ "tools": tools })
}

async fn call_tool(state: &AppState, id: &Value, name: &str, arguments: Value) -> Value {
    tracing::info!(tool = %name, "MCP server: tools/call");

    let outcome = match state.registry.get(name) {
        Some(tool) => state.bridge.execute_tool_flow(&tool, arguments).await,
        None => Err(BridgeError::ToolNotFound(name.to_string())),
    };

    match outcome {
        Ok(value) => success_response(id, to_tool_result(value)),
        Err(e) => {
            tracing::warn!(tool = %name, "MCP server: tools/call failed: {}", e);
            error_response(id, e.rpc_code(), &e.to_string())
        }
    }
}

// ── Listener lifecycle ──────────────────────────────────────────────────────

/// A running MCP server listener.
pub struct McpServerHandle {
    name: String,
    addr: SocketAddr,
    state: AppState,
    events: EventSink,
    task: JoinHandle<()>,
}

pub struct McpServer;

impl McpServer {
    /// Bind the configured port and start serving. Port 0 picks a free port.
    pub async fn start(
        config: ServerConfig,
        registry: ToolRegistry,
        bridge: ExecutionBridge,
        events: EventSink,
    ) -> BridgeResult<McpServerHandle> {
        config.validate()?;
        let state = AppState::new(&config, registry, bridge);
        let app = crate::create_router(state.clone(), config.cors);

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| BridgeError::Bind { port: config.port, reason: e.to_string() })?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Bind { port: config.port, reason: e.to_string() })?;

        let shutdown = state.shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            });
            if let Err(e) = serve.await {
                tracing::error!("MCP server: listener failed: {}", e);
            }
        });

        tracing::info!("MCP server: '{}' listening on http://{}", config.name, addr);
        events.emit(
            Topic::McpServerStarted,
            json!({ "name": config.name, "port": addr.port() }),
        );

        Ok(McpServerHandle {
            name: config.name,
            addr,
            state,
            events,
            task,
        })
    }
}

impl McpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shut the listener down gracefully; forced after a short grace window.
    pub async fn stop(mut self) {
        self.state.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await.is_err() {
            tracing::warn!("MCP server: '{}' did not drain in time, aborting", self.name);
            self.task.abort();
        }
        tracing::info!("MCP server: '{}' stopped", self.name);
        self.events.emit(
            Topic::McpServerStopped,
            json!({ "name": self.name, "port": self.addr.port() }),
        );
    }
}
