//! MCP client session over HTTP, SSE or WebSocket.
//!
//! `McpSession` is one logical connection to a remote MCP endpoint. It owns:
//!
//! - the connection state (`disconnected` / `connecting` / `connected` / `error`),
//! - at most one live `Channel`,
//! - the pending-request table for streaming transports,
//! - the reconnect timer (never more than one armed at a time).
//!
//! Every explicit `connect` or `disconnect` starts a new epoch. A connection
//! attempt or reconnect timer from an older epoch never installs a channel.
//!
//! Responses on streaming transports are matched to requests by id only, so
//! concurrent requests may complete in any order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::discovery;
use super::jsonrpc::{self, JsonRpcRequest};
use super::transport::{Channel, Outbound};
use crate::config::{TransportConfig, TransportKind};
use crate::correlation::{Correlator, Pending, Settled};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventSink, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Value snapshot of a session, safe to hand to the host.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub transport: TransportKind,
    pub url: String,
    pub state: ConnectionState,
    pub pending_requests: usize,
    pub reconnect_scheduled: bool,
}

type Reply = BridgeResult<Value>;

pub(crate) struct SessionCore {
    pub(crate) id: Uuid,
    pub(crate) config: TransportConfig,
    pub(crate) http: reqwest::Client,
    events: EventSink,
    pending: Correlator<String, Reply>,
    state: Mutex<ConnectionState>,
    channel: Mutex<Option<Channel>>,
    reconnect: Mutex<Option<CancellationToken>>,
    epoch: AtomicU64,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct McpSession {
    core: Arc<SessionCore>,
}

impl McpSession {
    pub fn new(config: TransportConfig, events: EventSink) -> BridgeResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BridgeError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            core: Arc::new(SessionCore {
                id: Uuid::new_v4(),
                config,
                http,
                events,
                pending: Correlator::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                channel: Mutex::new(None),
                reconnect: Mutex::new(None),
                epoch: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.core.config
    }

    pub fn events(&self) -> &EventSink {
        &self.core.events
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.core.reconnect.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.core.id,
            transport: self.core.config.transport,
            url: self.core.config.url.clone(),
            state: self.state(),
            pending_requests: self.pending_count(),
            reconnect_scheduled: self.reconnect_scheduled(),
        }
    }

    /// Open the session. An explicit connect supersedes a scheduled reconnect.
    pub async fn connect(&self) -> BridgeResult<()> {
        let epoch = self.core.next_epoch();
        self.core.cancel_reconnect();
        self.core.establish(epoch).await
    }

    /// Close the session and fail every pending request right away.
    pub fn disconnect(&self) {
        self.core.next_epoch();
        self.core.cancel_reconnect();
        let channel = {
            let mut slot = self.core.channel.lock().unwrap_or_else(|p| p.into_inner());
            self.core.set_state(ConnectionState::Disconnected);
            slot.take()
        };
        if let Some(channel) = channel {
            channel.close();
        }
        let aborted = self
            .core
            .pending
            .fail_all(|id| Err(BridgeError::Aborted { request_id: id.clone() }));
        tracing::info!(
            "MCP client: disconnected session {} ({} pending request(s) aborted)",
            self.core.id,
            aborted
        );
    }

    /// Send a JSON-RPC request and return the full reply envelope.
    pub async fn send_request(&self, method: &str, params: Value) -> BridgeResult<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let outbound = {
            let channel = self.core.channel.lock().unwrap_or_else(|p| p.into_inner());
            channel.as_ref().map(Channel::outbound)
        }
        .ok_or(BridgeError::NotConnected)?;

        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = JsonRpcRequest::new(id, method, params);
        tracing::debug!(session = %self.core.id, id, method = %method, "MCP client: sending request");

        match outbound {
            Outbound::Http(url) => self.core.post_direct(url, &envelope).await,
            Outbound::Sse(url) => self.core.post_correlated(url, &envelope).await,
            Outbound::WebSocket(writer) => self.core.send_frame(writer, &envelope).await,
        }
    }

    /// Send a request and unwrap its `result`; a JSON-RPC error becomes `Rpc`.
    pub async fn call(&self, method: &str, params: Value) -> BridgeResult<Value> {
        let response = self.send_request(method, params).await?;
        jsonrpc::into_result(response).map_err(|e| BridgeError::Rpc {
            code: e.code,
            message: e.message,
        })
    }
}

impl SessionCore {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            tracing::debug!("MCP client: session {} {:?} -> {:?}", self.id, *state, next);
            *state = next;
        }
    }

    fn emit(&self, topic: Topic, mut payload: Value) {
        payload["sessionId"] = json!(self.id);
        self.events.emit(topic, payload);
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn superseded(&self) -> BridgeError {
        BridgeError::Transport(format!("connection attempt to {} was superseded", self.config.url))
    }

    /// Open a channel for `epoch`. State changes happen under the channel
    /// lock, so a concurrent `disconnect` always has the last word.
    async fn establish(self: &Arc<Self>, epoch: u64) -> BridgeResult<()> {
        let previous = {
            let mut slot = self.channel.lock().unwrap_or_else(|p| p.into_inner());
            if !self.is_current(epoch) {
                return Err(self.superseded());
            }
            self.set_state(ConnectionState::Connecting);
            slot.take()
        };
        if let Some(previous) = previous {
            tracing::debug!("MCP client: replacing live channel {}", previous.generation);
            previous.close();
        }

        let transport = self.config.transport;
        tracing::info!("MCP client: connecting to {} via {}", self.config.url, transport.as_str());

        let channel = match Channel::open(self, epoch).await {
            Ok(channel) => channel,
            Err(e) => {
                {
                    let _slot = self.channel.lock().unwrap_or_else(|p| p.into_inner());
                    if !self.is_current(epoch) {
                        tracing::debug!("MCP client: dropping failed attempt from a past epoch: {}", e);
                        return Err(e);
                    }
                    self.set_state(ConnectionState::Error);
                }
                tracing::warn!("MCP client: connection to {} failed: {}", self.config.url, e);
                self.emit(
                    Topic::Error,
                    json!({ "transport": transport.as_str(), "url": self.config.url, "message": e.to_string() }),
                );
                self.schedule_reconnect(epoch);
                return Err(e);
            }
        };

        let generation = channel.generation;
        let token = channel.token.clone();
        {
            let mut slot = self.channel.lock().unwrap_or_else(|p| p.into_inner());
            if !self.is_current(epoch) {
                drop(slot);
                tracing::debug!("MCP client: closing channel {} opened for a past epoch", generation);
                channel.close();
                return Err(self.superseded());
            }
            *slot = Some(channel);
            self.set_state(ConnectionState::Connected);
        }

        // The reader may have died before the channel was stored.
        if token.is_cancelled() {
            self.connection_lost(generation, "connection closed during setup", true);
            return Err(BridgeError::Transport(format!(
                "connection to {} closed during setup",
                self.config.url
            )));
        }

        tracing::info!("MCP client: connected to {} ({})", self.config.url, transport.as_str());
        self.emit(
            Topic::Connected,
            json!({ "transport": transport.as_str(), "url": self.config.url }),
        );

        if transport.is_streaming() {
            let session = McpSession { core: Arc::clone(self) };
            let delay = self.config.handshake_delay();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => discovery::run_handshake(&session).await,
                }
            });
        }
        Ok(())
    }

    /// Called by a channel reader when its connection ended on its own.
    pub(crate) fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str, is_error: bool) {
        let channel = {
            let mut slot = self.channel.lock().unwrap_or_else(|p| p.into_inner());
            let channel = match slot.as_ref() {
                Some(ch) if ch.generation == generation => slot.take(),
                _ => None,
            };
            if channel.is_some() {
                self.set_state(if is_error {
                    ConnectionState::Error
                } else {
                    ConnectionState::Disconnected
                });
            }
            channel
        };
        let Some(channel) = channel else {
            return;
        };
        let epoch = channel.epoch;
        channel.close();

        if !is_error {
            tracing::info!("MCP client: connection to {} {}", self.config.url, reason);
            return;
        }

        tracing::warn!("MCP client: connection to {} lost: {}", self.config.url, reason);
        self.emit(
            Topic::Error,
            json!({ "transport": self.config.transport.as_str(), "url": self.config.url, "message": reason }),
        );
        self.schedule_reconnect(epoch);
    }

    /// Arm the reconnect timer for `epoch`, unless one is already armed or
    /// the epoch has passed.
    fn schedule_reconnect(self: &Arc<Self>, epoch: u64) {
        if !self.config.auto_reconnect {
            return;
        }
        let token = {
            let mut slot = self.reconnect.lock().unwrap_or_else(|p| p.into_inner());
            if !self.is_current(epoch) {
                return;
            }
            if slot.is_some() {
                tracing::debug!("MCP client: reconnect already scheduled for {}", self.config.url);
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let delay = self.config.reconnect_delay();
        tracing::info!("MCP client: reconnecting to {} in {}ms", self.config.url, delay.as_millis());
        let core = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut slot = core.reconnect.lock().unwrap_or_else(|p| p.into_inner());
                if token.is_cancelled() || !core.is_current(epoch) {
                    return;
                }
                slot.take();
            }
            if let Err(e) = core.establish(epoch).await {
                tracing::debug!("MCP client: reconnect attempt failed: {}", e);
            }
        });
    }

    fn cancel_reconnect(&self) {
        let token = self.reconnect.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Route one inbound stream payload: a reply to a pending request, an
    /// unsolicited message, or (if it is not JSON) a raw payload.
    pub(crate) fn handle_inbound(&self, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_inbound_value(value),
            Err(e) => {
                tracing::warn!(
                    "MCP client: malformed {} payload from {}: {}",
                    self.config.transport.as_str(),
                    self.config.url,
                    e
                );
                self.emit(Topic::Raw, json!({ "data": raw }));
            }
        }
    }

    fn handle_inbound_value(&self, value: Value) {
        if let Some(key) = value.get("id").and_then(jsonrpc::id_key) {
            if self.pending.resolve(&key, Ok(value.clone())) {
                self.emit(Topic::Response, json!({ "requestId": key, "response": value }));
                return;
            }
        }
        self.emit(Topic::Message, json!({ "message": value }));
    }

    // ── Outbound ────────────────────────────────────────────────────────

    async fn post_direct(&self, url: Url, envelope: &JsonRpcRequest) -> BridgeResult<Value> {
        let request_id = envelope.id.to_string();
        let body = self.post(url, envelope).await?;
        let Some(text) = body else {
            return Err(BridgeError::Protocol(format!("empty reply to request {request_id}")));
        };
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Protocol(format!("reply to request {request_id} is not valid JSON: {e}")))?;
        self.emit(Topic::Response, json!({ "requestId": request_id, "response": value }));
        Ok(value)
    }

    async fn post_correlated(&self, url: Url, envelope: &JsonRpcRequest) -> BridgeResult<Value> {
        let key = envelope.id.to_string();
        let pending = self.pending.insert(key);

        match self.post(url, envelope).await {
            Ok(Some(text)) => {
                // Servers that answer in the POST body settle the entry here.
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    self.handle_inbound_value(value);
                }
            }
            Ok(None) => {}
            Err(e) => return Err(e),
        }
        self.await_reply(pending).await
    }

    async fn send_frame(
        &self,
        writer: tokio::sync::mpsc::UnboundedSender<WsMessage>,
        envelope: &JsonRpcRequest,
    ) -> BridgeResult<Value> {
        let key = envelope.id.to_string();
        let text = serde_json::to_string(envelope)
            .map_err(|e| BridgeError::Protocol(format!("cannot encode request {key}: {e}")))?;
        let pending = self.pending.insert(key);
        if writer.send(WsMessage::Text(text)).is_err() {
            return Err(BridgeError::Transport("WebSocket writer is closed".to_string()));
        }
        self.await_reply(pending).await
    }

    async fn await_reply(&self, pending: Pending<'_, String, Reply>) -> BridgeResult<Value> {
        let key = pending.key().clone();
        let timeout = self.config.request_timeout();
        match pending.wait(timeout).await {
            Settled::Resolved(reply) => reply,
            Settled::TimedOut => {
                tracing::warn!("MCP client: request {} timed out after {}ms", key, timeout.as_millis());
                Err(BridgeError::Timeout {
                    request_id: key,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Settled::Dropped => Err(BridgeError::Aborted { request_id: key }),
        }
    }

    /// POST an envelope; returns the body text, or `None` for an empty body.
    async fn post(&self, url: Url, envelope: &JsonRpcRequest) -> BridgeResult<Option<String>> {
        let request_id = envelope.id.to_string();
        let timeout = self.config.request_timeout();
        let response = self
            .http
            .post(url.clone())
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BridgeError::Timeout {
                        request_id: request_id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    BridgeError::Transport(format!("POST {url} failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::Transport(format!("reading reply from {url} failed: {e}")))?;
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "MCP server returned HTTP {}: {}",
                status,
                truncate_str(&text, 500)
            )));
        }
        Ok(Some(text).filter(|t| !t.trim().is_empty()))
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_len);
        format!("{}...", &s[..boundary])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(transport: TransportKind) -> McpSession {
        McpSession::new(
            TransportConfig {
                transport,
                url: "http://127.0.0.1:9".into(),
                auto_reconnect: false,
                ..TransportConfig::default()
            },
            EventSink::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
    }

    #[test]
    fn new_session_starts_disconnected() {
        let s = session(TransportKind::Websocket);
        let status = s.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.pending_requests, 0);
        assert!(!status.reconnect_scheduled);
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let err = McpSession::new(TransportConfig::default(), EventSink::new()).err().unwrap();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[tokio::test]
    async fn request_before_connect_fails_immediately() {
        let s = session(TransportKind::Http);
        let err = s.send_request("tools/list", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn inbound_payloads_are_classified() {
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let s = McpSession::new(
            TransportConfig {
                transport: TransportKind::Sse,
                url: "http://127.0.0.1:9".into(),
                ..TransportConfig::default()
            },
            events,
        )
        .unwrap();

        let reply = s.core.pending.insert("5".into());
        let key = reply.key().clone();
        s.core.handle_inbound(r#"{"jsonrpc":"2.0","id":5,"result":{}}"#);
        s.core.handle_inbound(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        s.core.handle_inbound("not json");

        assert_eq!(rx.recv().await.unwrap().topic, Topic::Response);
        assert_eq!(rx.recv().await.unwrap().topic, Topic::Message);
        let raw = rx.recv().await.unwrap();
        assert_eq!(raw.topic, Topic::Raw);
        assert_eq!(raw.payload["data"], "not json");
        assert!(matches!(reply.wait(Duration::from_secs(1)).await, Settled::Resolved(Ok(_))));
        assert!(!s.core.pending.contains(&key));
        assert_eq!(s.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_sets_error_state_and_schedules_one_reconnect() {
        let events = EventSink::new();
        let s = McpSession::new(
            TransportConfig {
                transport: TransportKind::Http,
                url: "http://127.0.0.1:9".into(),
                request_timeout_ms: 500,
                reconnect_delay_ms: 60_000,
                ..TransportConfig::default()
            },
            events,
        )
        .unwrap();

        assert!(s.connect().await.is_err());
        assert_eq!(s.state(), ConnectionState::Error);
        assert!(s.reconnect_scheduled());

        // A second failure must not arm a second timer.
        s.core.schedule_reconnect(s.core.epoch.load(Ordering::SeqCst));
        assert!(s.reconnect_scheduled());

        s.disconnect();
        assert!(!s.reconnect_scheduled());
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }
}
