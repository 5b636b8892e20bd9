//! Transport strategies for `McpSession`.
//!
//! A `Channel` is the single live low-level connection of a session. It is
//! opened by one of three strategies:
//!
//! - **HTTP**: a health probe at connect time, then one POST per request.
//! - **SSE**: a long-lived event stream for inbound messages, POSTs outbound.
//! - **WebSocket**: one duplex socket for both directions.
//!
//! Background readers report back to the session through `SessionCore`; they
//! never touch the pending table directly.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::client::SessionCore;
use super::sse::{SseDecoder, SseFrame};
use crate::config::TransportKind;
use crate::error::{BridgeError, BridgeResult};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Where outbound requests go for the current channel.
#[derive(Clone)]
pub(crate) enum Outbound {
    /// POST, the response body is the reply.
    Http(Url),
    /// POST, the reply may come back in the body or on the event stream.
    Sse(Url),
    /// Text frame on the socket.
    WebSocket(mpsc::UnboundedSender<WsMessage>),
}

enum ChannelKind {
    Http { rpc_url: Url },
    Sse { post_url: Arc<Mutex<Url>> },
    WebSocket { writer: mpsc::UnboundedSender<WsMessage> },
}

pub(crate) struct Channel {
    pub(crate) generation: u64,
    /// Session epoch the channel was opened under.
    pub(crate) epoch: u64,
    pub(crate) token: CancellationToken,
    kind: ChannelKind,
}

impl Channel {
    /// Open a channel with the strategy selected by the session config.
    pub(crate) async fn open(core: &Arc<SessionCore>, epoch: u64) -> BridgeResult<Channel> {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let kind = match core.config.transport {
            TransportKind::Http => open_http(core).await?,
            TransportKind::Sse => open_sse(core, generation, token.clone()).await?,
            TransportKind::Websocket => open_websocket(core, generation, token.clone()).await?,
        };
        Ok(Channel { generation, epoch, token, kind })
    }

    pub(crate) fn outbound(&self) -> Outbound {
        match &self.kind {
            ChannelKind::Http { rpc_url } => Outbound::Http(rpc_url.clone()),
            ChannelKind::Sse { post_url } => {
                Outbound::Sse(post_url.lock().unwrap_or_else(|p| p.into_inner()).clone())
            }
            ChannelKind::WebSocket { writer } => Outbound::WebSocket(writer.clone()),
        }
    }

    /// Close the connection. Readers see the cancelled token and exit quietly.
    pub(crate) fn close(self) {
        if let ChannelKind::WebSocket { writer } = &self.kind {
            let _ = writer.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
        }
        self.token.cancel();
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────────

async fn open_http(core: &Arc<SessionCore>) -> BridgeResult<ChannelKind> {
    let health_url = core.config.endpoint(&core.config.health_path)?;
    let response = core
        .http
        .get(health_url.clone())
        .timeout(core.config.request_timeout())
        .send()
        .await
        .map_err(|e| BridgeError::Transport(format!("health check {health_url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::Transport(format!(
            "health check {health_url} returned HTTP {status}"
        )));
    }

    Ok(ChannelKind::Http {
        rpc_url: core.config.endpoint(&core.config.rpc_path)?,
    })
}

// ── SSE ─────────────────────────────────────────────────────────────────────

async fn open_sse(core: &Arc<SessionCore>, generation: u64, token: CancellationToken) -> BridgeResult<ChannelKind> {
    let stream_url = core.config.endpoint(&core.config.sse_path)?;
    let request = core
        .http
        .get(stream_url.clone())
        .header("Accept", "text/event-stream")
        .send();

    let response = tokio::time::timeout(core.config.request_timeout(), request)
        .await
        .map_err(|_| BridgeError::Transport(format!("event stream {stream_url} did not answer in time")))?
        .map_err(|e| BridgeError::Transport(format!("event stream {stream_url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::Transport(format!(
            "event stream {stream_url} returned HTTP {status}"
        )));
    }

    let post_url = Arc::new(Mutex::new(core.config.endpoint(&core.config.rpc_path)?));
    let reader_core = Arc::clone(core);
    let reader_post_url = Arc::clone(&post_url);
    tokio::spawn(async move {
        let outcome = read_sse(&reader_core, &token, response, &reader_post_url).await;
        finish_reader(&reader_core, generation, &token, outcome);
    });

    Ok(ChannelKind::Sse { post_url })
}

async fn read_sse(
    core: &Arc<SessionCore>,
    token: &CancellationToken,
    response: reqwest::Response,
    post_url: &Arc<Mutex<Url>>,
) -> Result<(), String> {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for frame in decoder.feed(&bytes) {
                        handle_sse_frame(core, frame, post_url);
                    }
                }
                Some(Err(e)) => return Err(format!("event stream error: {e}")),
                None => {
                    if let Some(frame) = decoder.flush() {
                        handle_sse_frame(core, frame, post_url);
                    }
                    return Err("event stream closed by server".to_string());
                }
            }
        }
    }
}

fn handle_sse_frame(core: &Arc<SessionCore>, frame: SseFrame, post_url: &Arc<Mutex<Url>>) {
    if frame.event.as_deref() == Some("endpoint") {
        let current = post_url.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match current.join(frame.data.trim()) {
            Ok(url) => {
                tracing::debug!("MCP client: server announced POST endpoint {}", url);
                *post_url.lock().unwrap_or_else(|p| p.into_inner()) = url;
            }
            Err(e) => tracing::warn!("MCP client: ignoring bad endpoint event '{}': {}", frame.data, e),
        }
        return;
    }
    core.handle_inbound(&frame.data);
}

// ── WebSocket ───────────────────────────────────────────────────────────────

async fn open_websocket(
    core: &Arc<SessionCore>,
    generation: u64,
    token: CancellationToken,
) -> BridgeResult<ChannelKind> {
    let url = core.config.websocket_url()?;
    let (socket, _) = tokio::time::timeout(core.config.request_timeout(), connect_async(url.as_str()))
        .await
        .map_err(|_| BridgeError::Transport(format!("WebSocket connect to {url} timed out")))?
        .map_err(|e| BridgeError::Transport(format!("WebSocket connect to {url} failed: {e}")))?;

    let (mut sink, mut source) = socket.split();
    let (writer, mut outbox) = mpsc::unbounded_channel::<WsMessage>();

    // The writer ends after sending a close frame or when every sender is gone.
    tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if let Err(e) = sink.send(msg).await {
                tracing::debug!("MCP client: WebSocket write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_core = Arc::clone(core);
    tokio::spawn(async move {
        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => reader_core.handle_inbound(&text),
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        reader_core.handle_inbound(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                        if code == 1000 {
                            break Ok(());
                        }
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        break Err(format!("WebSocket closed with code {code} {reason}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(format!("WebSocket read error: {e}")),
                    None => break Err("WebSocket stream ended without close frame".to_string()),
                }
            }
        };
        finish_reader(&reader_core, generation, &token, outcome);
    });

    Ok(ChannelKind::WebSocket { writer })
}

// ── Shared reader exit ──────────────────────────────────────────────────────

/// Report a reader exit to the session unless the channel was closed on
/// purpose (cancelled token).
fn finish_reader(core: &Arc<SessionCore>, generation: u64, token: &CancellationToken, outcome: Result<(), String>) {
    let intentional = token.is_cancelled();
    token.cancel();
    if intentional {
        tracing::debug!("MCP client: reader for channel {} stopped", generation);
        return;
    }
    match outcome {
        Ok(()) => core.connection_lost(generation, "closed by server", false),
        Err(reason) => core.connection_lost(generation, &reason, true),
    }
}
