//! Symbolic command surface for the flow host.
//!
//! The host sends JSON objects tagged by `command`; `CommandRouter` routes
//! them to whichever components this node was configured with. Failures are
//! published as `error` events rather than returned to the host.

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventSink, Topic};
use crate::mcp::bridge::{ExecutionBridge, ExecutionResponse};
use crate::mcp::client::McpSession;
use crate::mcp::registry::ToolRegistry;
use crate::supervisor::ProcessSupervisor;

fn empty_params() -> Value {
    json!({})
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum NodeCommand {
    Start,
    Stop,
    Restart,
    Status,
    Connect,
    Disconnect,
    Request {
        method: String,
        #[serde(default = "empty_params")]
        params: Value,
    },
    Register {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default, rename = "inputSchema")]
        input_schema: Option<Value>,
    },
    Unregister {
        name: String,
    },
    Update {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default, rename = "inputSchema")]
        input_schema: Option<Value>,
    },
    ExecutionResponse(ExecutionResponse),
}

impl NodeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            NodeCommand::Start => "start",
            NodeCommand::Stop => "stop",
            NodeCommand::Restart => "restart",
            NodeCommand::Status => "status",
            NodeCommand::Connect => "connect",
            NodeCommand::Disconnect => "disconnect",
            NodeCommand::Request { .. } => "request",
            NodeCommand::Register { .. } => "register",
            NodeCommand::Unregister { .. } => "unregister",
            NodeCommand::Update { .. } => "update",
            NodeCommand::ExecutionResponse(_) => "execution-response",
        }
    }
}

/// Routes host commands to the configured components.
#[derive(Clone)]
pub struct CommandRouter {
    owner: String,
    events: EventSink,
    registry: ToolRegistry,
    supervisor: Option<ProcessSupervisor>,
    session: Option<McpSession>,
    bridge: Option<ExecutionBridge>,
}

impl CommandRouter {
    pub fn new(events: EventSink, registry: ToolRegistry) -> Self {
        Self {
            owner: Uuid::new_v4().to_string(),
            events,
            registry,
            supervisor: None,
            session: None,
            bridge: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_session(mut self, session: McpSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_bridge(mut self, bridge: ExecutionBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Id under which this router registers tools.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run a command; any failure becomes an `error` event.
    pub async fn dispatch(&self, command: NodeCommand) {
        let name = command.name();
        if let Err(e) = self.handle(command).await {
            tracing::warn!("commands: '{}' failed: {}", name, e);
            self.events.emit(
                Topic::Error,
                json!({ "command": name, "kind": e.kind(), "message": e.to_string() }),
            );
        }
    }

    pub async fn handle(&self, command: NodeCommand) -> BridgeResult<Value> {
        match command {
            NodeCommand::Start => {
                self.supervisor()?.start()?;
                Ok(Value::Null)
            }
            NodeCommand::Stop => {
                self.supervisor()?.stop()?;
                Ok(Value::Null)
            }
            NodeCommand::Restart => {
                self.supervisor()?.restart().await?;
                Ok(Value::Null)
            }
            NodeCommand::Status => {
                let status = json!({
                    "supervisor": self.supervisor.as_ref().map(ProcessSupervisor::status),
                    "session": self.session.as_ref().map(McpSession::status),
                    "toolCount": self.registry.len(),
                });
                self.events.emit(Topic::Message, json!({ "status": status }));
                Ok(status)
            }
            NodeCommand::Connect => {
                // The session reports its own connection failures.
                if let Err(e) = self.session()?.connect().await {
                    tracing::debug!("commands: connect failed: {}", e);
                }
                Ok(Value::Null)
            }
            NodeCommand::Disconnect => {
                self.session()?.disconnect();
                Ok(Value::Null)
            }
            NodeCommand::Request { method, params } => self.session()?.send_request(&method, params).await,
            NodeCommand::Register { name, description, input_schema } => {
                Ok(self.register(&name, &description, input_schema))
            }
            NodeCommand::Unregister { name } => {
                self.unregister(&name);
                Ok(Value::Null)
            }
            NodeCommand::Update { name, description, input_schema } => {
                self.unregister(&name);
                Ok(self.register(&name, &description, input_schema))
            }
            NodeCommand::ExecutionResponse(response) => {
                let settled = self.bridge()?.complete(response);
                Ok(json!({ "settled": settled }))
            }
        }
    }

    /// Tear down everything this router started or registered.
    pub async fn close(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
        if let Some(session) = &self.session {
            session.disconnect();
        }
        for tool in self.registry.unregister_owned_by(&self.owner) {
            self.events.emit(Topic::ToolUnregistered, json!({ "name": tool.name }));
        }
    }

    fn register(&self, name: &str, description: &str, input_schema: Option<Value>) -> Value {
        let tool = self.registry.register(name, description, input_schema, Some(&self.owner));
        let mcp = tool.to_mcp();
        self.events.emit(Topic::ToolRegistered, mcp.clone());
        mcp
    }

    fn unregister(&self, name: &str) {
        if self.registry.unregister(name).is_some() {
            self.events.emit(Topic::ToolUnregistered, json!({ "name": name }));
        }
    }

    fn supervisor(&self) -> BridgeResult<&ProcessSupervisor> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| BridgeError::Config("no process supervisor configured".into()))
    }

    fn session(&self) -> BridgeResult<&McpSession> {
        self.session
            .as_ref()
            .ok_or_else(|| BridgeError::Config("no MCP client configured".into()))
    }

    fn bridge(&self) -> BridgeResult<&ExecutionBridge> {
        self.bridge
            .as_ref()
            .ok_or_else(|| BridgeError::Config("no MCP server configured".into()))
    }
}
