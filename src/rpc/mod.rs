//! Authorization gate for RPC calls.
//!
//! Every call passes through [`AuthInterceptor::intercept`] before its
//! handler runs. Calls without credentials, or with a token the gate
//! rejects, fail closed with [`RpcStatus::Unauthenticated`] and an
//! `auth.failed` audit entry; the handler never sees them.

pub mod service;

use std::future::Future;

use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::audit::{metadata, Auditor};
use crate::auth::{bind_user_id, strip_bearer, RequestContext, TokenGate};

pub use service::{PtyRpcService, RpcResult, RpcService};

/// Metadata key carrying the bearer credential.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Call metadata. Keys are case-insensitive.
pub type RpcMetadata = HeaderMap;

/// Outcome of a failed RPC call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcStatus {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl RpcStatus {
    pub fn code(&self) -> &'static str {
        match self {
            RpcStatus::Unauthenticated(_) => "unauthenticated",
            RpcStatus::InvalidArgument(_) => "invalid_argument",
            RpcStatus::NotFound(_) => "not_found",
            RpcStatus::AlreadyExists(_) => "already_exists",
            RpcStatus::Unimplemented(_) => "unimplemented",
            RpcStatus::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcStatus::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            RpcStatus::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RpcStatus::NotFound(_) => StatusCode::NOT_FOUND,
            RpcStatus::AlreadyExists(_) => StatusCode::CONFLICT,
            RpcStatus::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            RpcStatus::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wraps unary RPC handlers with token verification and auditing.
#[derive(Clone, Debug)]
pub struct AuthInterceptor {
    gate: TokenGate,
    auditor: Auditor,
}

impl AuthInterceptor {
    pub fn new(gate: TokenGate, auditor: Auditor) -> Self {
        Self { gate, auditor }
    }

    /// Verify the caller, then run `handler` with the authorized context.
    /// The handler's result is returned unchanged.
    pub async fn intercept<T, F, Fut>(
        &self,
        ctx: Option<&RequestContext>,
        metadata: Option<&RpcMetadata>,
        method: &str,
        handler: F,
    ) -> Result<T, RpcStatus>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T, RpcStatus>>,
    {
        let authorized = self.authorize(ctx, metadata, method)?;
        handler(authorized).await
    }

    /// The gate half of [`AuthInterceptor::intercept`].
    pub fn authorize(
        &self,
        ctx: Option<&RequestContext>,
        metadata: Option<&RpcMetadata>,
        method: &str,
    ) -> Result<RequestContext, RpcStatus> {
        let credential = metadata
            .and_then(|md| md.get(AUTHORIZATION_KEY))
            .and_then(|value| value.to_str().ok())
            .map(strip_bearer)
            .filter(|token| !token.is_empty());
        let Some(token) = credential else {
            self.auditor.log_audit(
                ctx,
                "auth.failed",
                method,
                false,
                metadata_pairs("missing metadata"),
            );
            return Err(RpcStatus::Unauthenticated("missing metadata".into()));
        };

        match self.gate.verify(token) {
            Ok(user_id) => Ok(bind_user_id(ctx, &user_id)),
            Err(e) => {
                let message = e.to_string();
                tracing::debug!(method, error = %message, "rpc call rejected");
                self.auditor
                    .log_audit(ctx, "auth.failed", method, false, metadata_pairs(&message));
                Err(RpcStatus::Unauthenticated(message))
            }
        }
    }
}

fn metadata_pairs(error: &str) -> crate::audit::AuditMetadata {
    metadata([("error", error)])
}
