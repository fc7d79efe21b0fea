mod auth;
pub mod error;
mod rpc;
mod ws;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::audit::Auditor;
use crate::auth::TokenGate;
use crate::connection::ConnectionConfig;
use crate::hub::Hub;
use crate::pty::PtyWriter;
use crate::rpc::RpcService;

/// Shared state behind every route.
///
/// `pty` and `gate` are optional so a misconfigured server still answers
/// with a clear 503/500 instead of refusing to start.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub pty: Option<Arc<dyn PtyWriter>>,
    pub gate: Option<TokenGate>,
    pub auditor: Auditor,
    pub connection: ConnectionConfig,
    pub rpc: Option<Arc<dyn RpcService>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connection_count().await,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_connect))
        .route("/rpc/{method}", post(rpc::rpc_call))
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
}
