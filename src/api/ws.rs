use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, Request, State},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};

use crate::audit::metadata;
use crate::auth::bind_user_id;
use crate::connection::Connection;

use super::auth::{extract_bearer, extract_session_id, Credential};
use super::error::ApiError;
use super::AppState;

const WS_RESOURCE: &str = "/ws";

/// `GET /ws?id=<session>`: authorize, upgrade, and admit a connection.
///
/// Checks run in a fixed order and stop at the first failure:
/// PTY capability, Authorization header, token presence, secret,
/// token validity, session id, hub still running. Only then is the upgrade
/// performed.
pub(super) async fn ws_connect(State(state): State<AppState>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let auditor = &state.auditor;

    let Some(pty) = state.pty.clone() else {
        tracing::error!("websocket rejected: pty backend not configured");
        return ApiError::PtyUnavailable.into_response();
    };

    let token = match extract_bearer(&parts.headers) {
        Credential::Missing => {
            auditor.log_audit(
                None,
                "auth.failed",
                WS_RESOURCE,
                false,
                metadata([("transport", "websocket"), ("reason", "missing_authorization")]),
            );
            return ApiError::AuthRequired.into_response();
        }
        Credential::Empty => {
            auditor.log_audit(
                None,
                "auth.failed",
                WS_RESOURCE,
                false,
                metadata([("transport", "websocket"), ("reason", "empty_token")]),
            );
            return ApiError::EmptyToken.into_response();
        }
        Credential::Token(token) => token.to_string(),
    };

    let Some(gate) = state.gate.clone() else {
        tracing::error!("websocket rejected: token secret not configured");
        return ApiError::SecretNotConfigured.into_response();
    };

    let user_id = match gate.verify(&token) {
        Ok(user_id) => user_id,
        Err(e) => {
            let message = e.to_string();
            auditor.log_audit(
                None,
                "auth.failed",
                WS_RESOURCE,
                false,
                metadata([
                    ("transport", "websocket"),
                    ("reason", "invalid_token"),
                    ("error", &message),
                ]),
            );
            return ApiError::AuthInvalid(message).into_response();
        }
    };
    let ctx = bind_user_id(None, &user_id);

    let Some(session_id) = extract_session_id(&parts.uri) else {
        auditor.log_audit(
            Some(&ctx),
            "websocket.connected",
            WS_RESOURCE,
            false,
            metadata([("transport", "websocket"), ("reason", "missing_pty_id")]),
        );
        return ApiError::MissingSessionId.into_response();
    };

    if state.hub.is_shutting_down() {
        tracing::debug!(session = %session_id, "websocket rejected: hub shutting down");
        return ApiError::ShuttingDown.into_response();
    }

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let config = state.connection;
    let hub = state.hub.clone();
    let auditor = state.auditor.clone();
    ws.max_message_size(config.max_message_size)
        .on_failed_upgrade(|e| tracing::warn!(?e, "websocket upgrade failed"))
        .on_upgrade(move |mut socket| async move {
            let registration = match hub.register(&session_id).await {
                Ok(registration) => registration,
                Err(e) => {
                    tracing::debug!(session = %session_id, "websocket dropped: {e}");
                    let _ = SinkExt::close(&mut socket).await;
                    return;
                }
            };

            auditor.log_audit(
                Some(&ctx),
                "websocket.connected",
                WS_RESOURCE,
                true,
                metadata([
                    ("remote_addr", &remote_addr),
                    ("transport", "websocket"),
                    ("client_id", &session_id),
                ]),
            );
            tracing::info!(
                session = %session_id,
                user = %user_id,
                remote = %remote_addr,
                "websocket connected"
            );

            let conn = Connection::new(registration.id, session_id, ctx, pty, hub, config);
            let (writer, reader) = socket.split();
            conn.start_registered(reader, writer, registration);
        })
}
