//! Topic-tagged output events for the flow host.
//!
//! Components never talk to the host directly; they publish `BridgeEvent`s on
//! an `EventSink` and the host decides where they go. The sink is a tokio
//! broadcast channel, so publishing never blocks and events emitted while
//! nobody is subscribed are simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    Stdout,
    Stderr,
    Started,
    Exit,
    Connected,
    Response,
    Message,
    Error,
    Raw,
    Handshake,
    ToolRegistered,
    ToolUnregistered,
    McpServerStarted,
    McpServerStopped,
    ExecutionRequest,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Stdout => "stdout",
            Topic::Stderr => "stderr",
            Topic::Started => "started",
            Topic::Exit => "exit",
            Topic::Connected => "connected",
            Topic::Response => "response",
            Topic::Message => "message",
            Topic::Error => "error",
            Topic::Raw => "raw",
            Topic::Handshake => "handshake",
            Topic::ToolRegistered => "tool-registered",
            Topic::ToolUnregistered => "tool-unregistered",
            Topic::McpServerStarted => "mcp-server-started",
            Topic::McpServerStopped => "mcp-server-stopped",
            Topic::ExecutionRequest => "execution-request",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub topic: Topic,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Cloneable publisher handle. All clones feed the same subscribers.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, topic: Topic, payload: Value) {
        tracing::trace!(topic = %topic, "event emitted");
        let _ = self.tx.send(BridgeEvent {
            topic,
            payload,
            timestamp: Utc::now(),
        });
    }
}
