// mcp-flow-bridge - MCP server state

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::mcp::bridge::ExecutionBridge;
use crate::mcp::registry::ToolRegistry;

/// Shared state behind every MCP server route.
#[derive(Clone)]
pub struct AppState {
    pub server_name: String,
    pub version: String,
    pub registry: ToolRegistry,
    pub bridge: ExecutionBridge,
    pub start_time: Instant,
    pub heartbeat_interval: Duration,
    /// Cancelled when the listener shuts down; open event streams end with it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &ServerConfig, registry: ToolRegistry, bridge: ExecutionBridge) -> Self {
        Self {
            server_name: config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            registry,
            bridge,
            start_time: Instant::now(),
            heartbeat_interval: config.heartbeat_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
