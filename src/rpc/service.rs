use futures::future::{self, BoxFuture, FutureExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::RequestContext;
use crate::pty::{PtyError, PtyManager, PtyWriter};

use super::RpcStatus;

pub type RpcResult = Result<Value, RpcStatus>;

/// Business handlers reachable through the RPC gate.
pub trait RpcService: Send + Sync {
    fn call(&self, ctx: RequestContext, method: &str, params: Value) -> BoxFuture<'static, RpcResult>;
}

#[derive(Debug, Deserialize)]
struct SpawnParams {
    id: Option<String>,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Deserialize)]
struct KillParams {
    id: String,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcStatus> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| RpcStatus::InvalidArgument(e.to_string()))
}

impl From<PtyError> for RpcStatus {
    fn from(e: PtyError) -> Self {
        match e {
            PtyError::NotFound(id) => RpcStatus::NotFound(id),
            PtyError::AlreadyExists(id) => RpcStatus::AlreadyExists(id),
            other => RpcStatus::Internal(other.to_string()),
        }
    }
}

/// PTY lifecycle methods backed by a local [`PtyManager`].
///
/// Methods: `pty.spawn`, `pty.list`, `pty.kill`, `auth.whoami`.
#[derive(Debug, Clone)]
pub struct PtyRpcService {
    manager: PtyManager,
}

impl PtyRpcService {
    pub fn new(manager: PtyManager) -> Self {
        Self { manager }
    }

    fn dispatch(&self, ctx: &RequestContext, method: &str, params: Value) -> RpcResult {
        match method {
            "pty.spawn" => {
                let params: SpawnParams = parse_params(params)?;
                if let Some(id) = &params.id {
                    if id.is_empty() {
                        return Err(RpcStatus::InvalidArgument("id must not be empty".into()));
                    }
                }
                let info = self.manager.spawn(params.id, params.cols, params.rows)?;
                tracing::info!(user = ?ctx.user_id(), session = %info.id, "pty spawned via rpc");
                serde_json::to_value(info).map_err(|e| RpcStatus::Internal(e.to_string()))
            }
            "pty.list" => serde_json::to_value(self.manager.list())
                .map_err(|e| RpcStatus::Internal(e.to_string())),
            "pty.kill" => {
                let params: KillParams = parse_params(params)?;
                self.manager.kill_pty(&params.id)?;
                tracing::info!(user = ?ctx.user_id(), session = %params.id, "pty killed via rpc");
                Ok(json!({ "killed": params.id }))
            }
            "auth.whoami" => Ok(json!({ "user_id": ctx.user_id() })),
            other => Err(RpcStatus::Unimplemented(other.to_string())),
        }
    }
}

impl RpcService for PtyRpcService {
    fn call(&self, ctx: RequestContext, method: &str, params: Value) -> BoxFuture<'static, RpcResult> {
        future::ready(self.dispatch(&ctx, method, params)).boxed()
    }
}
