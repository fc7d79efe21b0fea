use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::rpc::{AuthInterceptor, RpcStatus};

use super::error::ApiError;
use super::AppState;

/// `POST /rpc/{method}`: run `method` through the auth gate, then the
/// configured [`RpcService`](crate::rpc::RpcService).
pub(super) async fn rpc_call(
    State(state): State<AppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gate = state.gate.clone().ok_or(ApiError::SecretNotConfigured)?;
    let interceptor = AuthInterceptor::new(gate, state.auditor.clone());
    let service = state.rpc.clone();
    let name = method.clone();

    let result = interceptor
        .intercept(None, Some(&headers), &method, |ctx| async move {
            let params = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&body)
                    .map_err(|e| RpcStatus::InvalidArgument(format!("params: {e}")))?
            };
            match service {
                Some(service) => service.call(ctx, &name, params).await,
                None => Err(RpcStatus::Unimplemented(name)),
            }
        })
        .await?;

    Ok(Json(json!({ "result": result })))
}
