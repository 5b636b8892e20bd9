use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use mcp_flow_bridge::commands::{CommandRouter, NodeCommand};
use mcp_flow_bridge::config::BridgeConfig;
use mcp_flow_bridge::events::{EventSink, Topic};
use mcp_flow_bridge::mcp::{ExecutionBridge, McpServer, McpSession, ToolRegistry};
use mcp_flow_bridge::supervisor::ProcessSupervisor;

const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    // stdout carries the event stream, so logs go to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = BridgeConfig::from_env()?;
    let events = EventSink::new();
    let registry = ToolRegistry::shared();

    // ── Event stream → stdout (JSON lines) ──
    let writer = {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Ok(mut line) = serde_json::to_string(&event) else {
                            continue;
                        };
                        line.push('\n');
                        if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => tracing::warn!("host: dropped {} events (slow stdout)", n),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let mut router = CommandRouter::new(events.clone(), registry.clone());
    let mut auto_start = false;
    let mut auto_connect = false;

    if let Some(cfg) = config.supervisor {
        auto_start = cfg.auto_start;
        router = router.with_supervisor(ProcessSupervisor::new(cfg, events.clone()));
    }
    if let Some(cfg) = config.client {
        auto_connect = cfg.auto_connect;
        router = router.with_session(McpSession::new(cfg, events.clone())?);
    }

    // ── MCP server + execution requests → host ──
    let server = match config.server {
        Some(cfg) => {
            let (bridge, mut requests) = ExecutionBridge::new(cfg.execution_timeout());
            let forward = events.clone();
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    match serde_json::to_value(&request) {
                        Ok(payload) => forward.emit(Topic::ExecutionRequest, payload),
                        Err(e) => tracing::error!("host: cannot encode execution request: {}", e),
                    }
                }
            });
            router = router.with_bridge(bridge.clone());
            Some(McpServer::start(cfg, registry.clone(), bridge, events.clone()).await?)
        }
        None => None,
    };

    if auto_start {
        router.dispatch(NodeCommand::Start).await;
    }
    if auto_connect {
        let r = router.clone();
        tokio::spawn(async move { r.dispatch(NodeCommand::Connect).await });
    }

    tracing::info!("host: reading commands from stdin");
    let stdin_loop = {
        let router = router.clone();
        let events = events.clone();
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<NodeCommand>(&line) {
                    Ok(command) => {
                        let r = router.clone();
                        tokio::spawn(async move { r.dispatch(command).await });
                    }
                    Err(e) => {
                        tracing::warn!("host: bad command line: {}", e);
                        events.emit(
                            Topic::Error,
                            serde_json::json!({ "kind": "protocol", "message": format!("Invalid command: {e}") }),
                        );
                    }
                }
            }
            tracing::info!("host: stdin closed");
        }
    };

    tokio::select! {
        _ = stdin_loop => {},
        _ = shutdown_signal() => {},
    }

    router.close().await;
    if let Some(server) = server {
        server.stop().await;
    }
    drop(router);
    drop(events);
    let _ = tokio::time::timeout(EVENT_FLUSH_TIMEOUT, writer).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("host: cannot install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
