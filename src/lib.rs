pub mod commands;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod mcp;
pub mod state;
pub mod supervisor;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the MCP server router with the given state.
/// Kept separate from `McpServer::start` so integration tests can drive the
/// app without binding to a network port.
pub fn create_router(state: AppState, cors: bool) -> Router {
    let mut rpc = post(mcp::server::mcp_handler);
    if cors {
        rpc = rpc.options(mcp::server::preflight_handler);
    }

    let router = Router::new()
        .route("/health", get(mcp::server::health_handler))
        .route("/mcp", rpc)
        .route("/sse", get(mcp::server::sse_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        );

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
