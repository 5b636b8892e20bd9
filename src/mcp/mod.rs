//! MCP (Model Context Protocol) support: client + server.
//!
//! **Client** (`McpSession`): one session to a remote MCP endpoint over HTTP,
//! SSE or WebSocket, with a discovery handshake on streaming transports.
//!
//! **Server** (`McpServer`): exposes the process-wide `ToolRegistry` as an MCP
//! endpoint and runs calls through the `ExecutionBridge`.
//!
//! Protocol: JSON-RPC 2.0. Spec: <https://spec.modelcontextprotocol.io/2024-11-05/>

pub mod bridge;
pub mod client;
pub mod discovery;
pub mod jsonrpc;
pub mod registry;
pub mod server;
pub mod sse;
mod transport;

pub use bridge::{ExecutionBridge, ExecutionRequest, ExecutionResponse};
pub use client::{ConnectionState, McpSession, SessionStatus};
pub use registry::{ToolDefinition, ToolRegistry};
pub use server::{McpServer, McpServerHandle};
