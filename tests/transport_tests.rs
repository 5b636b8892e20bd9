// mcp-flow-bridge - transport client integration tests
//
// Each test runs a real loopback server (our own MCP server, or a small axum
// WebSocket endpoint) and drives an `McpSession` against it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use mcp_flow_bridge::config::{ServerConfig, TransportConfig, TransportKind};
use mcp_flow_bridge::error::BridgeError;
use mcp_flow_bridge::events::{BridgeEvent, EventSink, Topic};
use mcp_flow_bridge::mcp::{
    ConnectionState, ExecutionBridge, McpServer, McpServerHandle, McpSession, ToolRegistry,
};

// ── Helpers ─────────────────────────────────────────────────────────────────

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn mcp_server(registry: ToolRegistry) -> McpServerHandle {
    let config = ServerConfig {
        name: "loopback".into(),
        port: 0,
        ..ServerConfig::default()
    };
    let (bridge, _rx) = ExecutionBridge::new(Duration::from_secs(5));
    McpServer::start(config, registry, bridge, EventSink::new()).await.unwrap()
}

fn session(transport: TransportKind, url: String, events: EventSink) -> McpSession {
    McpSession::new(
        TransportConfig {
            transport,
            url,
            auto_reconnect: false,
            handshake_delay_ms: 60_000,
            request_timeout_ms: 5_000,
            ..TransportConfig::default()
        },
        events,
    )
    .unwrap()
}

async fn next_topic(rx: &mut broadcast::Receiver<BridgeEvent>, topic: Topic) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = rx.recv().await.unwrap();
            if ev.topic == topic {
                return ev;
            }
        }
    })
    .await
    .unwrap()
}

/// Holds requests until two have arrived, then answers them in reverse order.
async fn reversing_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let mut held: Vec<Value> = Vec::new();
        while let Some(Ok(msg)) = socket.recv().await {
            let Message::Text(text) = msg else { continue };
            held.push(serde_json::from_str(text.as_str()).unwrap());
            if held.len() == 2 {
                for req in held.drain(..).rev() {
                    let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req["method"]}});
                    if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// Reads requests and never answers.
async fn silent_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move { while let Some(Ok(_)) = socket.recv().await {} })
}

/// Closes with an abnormal code as soon as the socket opens.
async fn crashing_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = socket
            .send(Message::Close(Some(CloseFrame { code: 1011, reason: "boom".into() })))
            .await;
    })
}

fn ws_app() -> Router {
    Router::new()
        .route("/reversing", get(reversing_ws))
        .route("/silent", get(silent_ws))
        .route("/crashing", get(crashing_ws))
}

/// First health check fails, later ones answer slowly.
async fn flaky_health(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    StatusCode::OK
}

/// Event stream that carries every reply; POSTs are only acknowledged.
async fn reply_stream(
    State(replies): State<broadcast::Sender<String>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = replies.subscribe();
    Sse::new(async_stream::stream! {
        yield Ok(Event::default().comment("ready"));
        while let Ok(data) = rx.recv().await {
            yield Ok(Event::default().event("message").data(data));
        }
    })
}

async fn accept_post(State(replies): State<broadcast::Sender<String>>, Json(req): Json<Value>) -> StatusCode {
    let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"via": "stream", "method": req["method"]}});
    let _ = replies.send(reply.to_string());
    StatusCode::ACCEPTED
}

fn stream_reply_app() -> Router {
    let (replies, _) = broadcast::channel(16);
    Router::new()
        .route("/sse", get(reply_stream))
        .route("/mcp", post(accept_post))
        .with_state(replies)
}

// ── HTTP ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn http_session_lists_and_calls() {
    let registry = ToolRegistry::new();
    registry.register("weather", "Current weather", None, None);
    let server = mcp_server(registry).await;

    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = session(TransportKind::Http, format!("http://127.0.0.1:{}", server.port()), events);

    s.connect().await.unwrap();
    assert_eq!(s.state(), ConnectionState::Connected);
    let connected = next_topic(&mut rx, Topic::Connected).await;
    assert_eq!(connected.payload["transport"], "http");
    assert_eq!(connected.payload["sessionId"], json!(s.id()));

    let listed = s.call("tools/list", json!({})).await.unwrap();
    assert_eq!(listed["tools"][0]["name"], "weather");
    let response = next_topic(&mut rx, Topic::Response).await;
    assert_eq!(response.payload["response"]["result"], listed);

    let err = s.call("tools/call", json!({"name": "missing"})).await.unwrap_err();
    assert!(matches!(err, BridgeError::Rpc { code: -32602, .. }));

    s.disconnect();
    assert!(matches!(s.send_request("tools/list", json!({})).await, Err(BridgeError::NotConnected)));
    server.stop().await;
}

#[tokio::test]
async fn http_connect_to_dead_endpoint_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = session(TransportKind::Http, format!("http://127.0.0.1:{port}"), events);

    assert!(s.connect().await.is_err());
    assert_eq!(s.state(), ConnectionState::Error);
    assert!(!s.status().reconnect_scheduled);
    let err = next_topic(&mut rx, Topic::Error).await;
    assert_eq!(err.payload["transport"], "http");
}

#[tokio::test]
async fn disconnect_during_reconnect_attempt_stays_disconnected() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/health", get(flaky_health)).with_state(hits.clone());
    let addr = serve(app).await;

    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = McpSession::new(
        TransportConfig {
            transport: TransportKind::Http,
            url: format!("http://{addr}"),
            auto_reconnect: true,
            reconnect_delay_ms: 20,
            ..TransportConfig::default()
        },
        events,
    )
    .unwrap();

    assert!(s.connect().await.is_err());
    // The reconnect fires after 20ms and is now waiting on the slow health check.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    s.disconnect();
    assert_eq!(s.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(s.state(), ConnectionState::Disconnected);
    assert!(!s.reconnect_scheduled());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let topics: Vec<Topic> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.topic).collect();
    assert!(!topics.contains(&Topic::Connected), "got {topics:?}");
}

// ── SSE ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sse_reply_on_event_stream_resolves_request() {
    let addr = serve(stream_reply_app()).await;
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = session(TransportKind::Sse, format!("http://{addr}"), events);
    s.connect().await.unwrap();

    let (first, second) = tokio::join!(
        s.send_request("tools/list", json!({})),
        s.send_request("ping", json!({}))
    );
    let first = first.unwrap();
    assert_eq!(first["result"], json!({"via": "stream", "method": "tools/list"}));
    assert_eq!(second.unwrap()["result"]["method"], "ping");
    assert_eq!(s.pending_count(), 0);

    let response = next_topic(&mut rx, Topic::Response).await;
    assert_eq!(response.payload["response"]["result"]["via"], "stream");
    s.disconnect();
}

#[tokio::test]
async fn sse_session_runs_discovery_handshake() {
    let registry = ToolRegistry::new();
    registry.register(
        "forecast",
        "Weather forecast",
        Some(json!({
            "type": "object",
            "properties": {
                "unit": {"type": "string", "enum": ["c", "f"]},
                "days": {"type": "integer"}
            }
        })),
        None,
    );
    let server = mcp_server(registry).await;

    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = McpSession::new(
        TransportConfig {
            transport: TransportKind::Sse,
            url: format!("http://127.0.0.1:{}", server.port()),
            auto_reconnect: false,
            handshake_delay_ms: 20,
            ..TransportConfig::default()
        },
        events,
    )
    .unwrap();

    s.connect().await.unwrap();
    assert_eq!(s.status().transport, TransportKind::Sse);

    let init = next_topic(&mut rx, Topic::Handshake).await;
    assert_eq!(init.payload["subtype"], "initialization");
    assert_eq!(init.payload["result"]["serverInfo"]["name"], "loopback");

    let discovered = next_topic(&mut rx, Topic::Handshake).await;
    assert_eq!(discovered.payload["subtype"], "tools_discovered");
    assert_eq!(discovered.payload["toolCount"], 1);
    assert_eq!(discovered.payload["toolNames"], json!(["forecast"]));
    assert_eq!(
        discovered.payload["exampleCall"],
        json!({"method": "tools/call", "params": {"name": "forecast", "arguments": {"unit": "c", "days": 123}}})
    );
    assert_eq!(s.pending_count(), 0);

    s.disconnect();
    server.stop().await;
}

// ── WebSocket ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn websocket_out_of_order_replies_reach_their_callers() {
    let addr = serve(ws_app()).await;
    let s = session(TransportKind::Websocket, format!("http://{addr}/reversing"), EventSink::new());
    s.connect().await.unwrap();

    let (first, second) = tokio::join!(
        s.send_request("first", json!({})),
        s.send_request("second", json!({}))
    );
    assert_eq!(first.unwrap()["result"]["echo"], "first");
    assert_eq!(second.unwrap()["result"]["echo"], "second");
    assert_eq!(s.pending_count(), 0);
    s.disconnect();
}

#[tokio::test]
async fn disconnect_fails_every_pending_request() {
    let addr = serve(ws_app()).await;
    let s = session(TransportKind::Websocket, format!("ws://{addr}/silent"), EventSink::new());
    s.connect().await.unwrap();

    let mut calls = Vec::new();
    for i in 0..3 {
        let s = s.clone();
        calls.push(tokio::spawn(async move { s.send_request(&format!("m{i}"), json!({})).await }));
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        while s.pending_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    s.disconnect();
    assert_eq!(s.pending_count(), 0);
    assert_eq!(s.state(), ConnectionState::Disconnected);
    for call in calls {
        let outcome = tokio::time::timeout(Duration::from_millis(500), call).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(BridgeError::Aborted { .. })));
    }
}

#[tokio::test]
async fn unanswered_request_times_out_and_is_removed() {
    let addr = serve(ws_app()).await;
    let s = McpSession::new(
        TransportConfig {
            transport: TransportKind::Websocket,
            url: format!("ws://{addr}/silent"),
            request_timeout_ms: 100,
            auto_reconnect: false,
            handshake_delay_ms: 60_000,
            ..TransportConfig::default()
        },
        EventSink::new(),
    )
    .unwrap();
    s.connect().await.unwrap();

    let err = s.send_request("tools/list", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { timeout_ms: 100, .. }));
    assert_eq!(s.pending_count(), 0);
    s.disconnect();
}

#[tokio::test]
async fn abnormal_close_arms_one_reconnect_and_reconnects() {
    let addr = serve(ws_app()).await;
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = McpSession::new(
        TransportConfig {
            transport: TransportKind::Websocket,
            url: format!("ws://{addr}/crashing"),
            auto_reconnect: true,
            reconnect_delay_ms: 300,
            handshake_delay_ms: 60_000,
            ..TransportConfig::default()
        },
        events,
    )
    .unwrap();
    s.connect().await.unwrap();
    next_topic(&mut rx, Topic::Connected).await;

    let err = next_topic(&mut rx, Topic::Error).await;
    assert!(err.payload["message"].as_str().unwrap().contains("1011"));
    tokio::time::timeout(Duration::from_secs(1), async {
        while !s.reconnect_scheduled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(s.state(), ConnectionState::Error);

    let again = next_topic(&mut rx, Topic::Connected).await;
    assert_eq!(again.payload["transport"], "websocket");
    s.disconnect();
    assert!(!s.reconnect_scheduled());
    assert_eq!(s.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn abnormal_close_moves_session_to_error() {
    let addr = serve(ws_app()).await;
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let s = session(TransportKind::Websocket, format!("ws://{addr}/crashing"), events);
    s.connect().await.unwrap();

    let err = next_topic(&mut rx, Topic::Error).await;
    assert!(err.payload["message"].as_str().unwrap().contains("1011"));
    assert_eq!(s.state(), ConnectionState::Error);
}
