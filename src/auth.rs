//! Bearer token issuance/verification and request-scoped user binding.
//!
//! Tokens are HS256 JWTs carrying the user id, issue time and expiry.
//! Verification is pure: it inspects the token and the secret and returns
//! either the user id or a [`TokenError`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only signature scheme accepted by [`verify_token`].
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("secret must not be empty")]
    EmptySecret,

    #[error("validity must be a positive number of hours, got {0}")]
    InvalidValidity(i64),

    #[error("token must not be empty")]
    EmptyToken,

    #[error("unexpected signing method: {0:?}")]
    UnexpectedAlgorithm(Algorithm),

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is missing user id")]
    MissingUserId,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Claims carried by every issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue a token for `user_id` valid for `validity_hours` from now.
pub fn issue_token(user_id: &str, secret: &str, validity_hours: i64) -> Result<String, TokenError> {
    issue_token_at(user_id, secret, validity_hours, Utc::now())
}

/// Issue a token as if the current time were `now`.
pub fn issue_token_at(
    user_id: &str,
    secret: &str,
    validity_hours: i64,
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    if user_id.is_empty() {
        return Err(TokenError::EmptyUserId);
    }
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    if validity_hours <= 0 {
        return Err(TokenError::InvalidValidity(validity_hours));
    }

    let claims = Claims {
        user_id: user_id.to_string(),
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(validity_hours)).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(TOKEN_ALGORITHM),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| TokenError::Signing(e.to_string()))
}

/// Verify `token` against `secret`, returning the bound user id.
pub fn verify_token(token: &str, secret: &str) -> Result<String, TokenError> {
    verify_token_at(token, secret, Utc::now())
}

/// Verify `token` as if the current time were `now`.
pub fn verify_token_at(token: &str, secret: &str, now: DateTime<Utc>) -> Result<String, TokenError> {
    if token.is_empty() {
        return Err(TokenError::EmptyToken);
    }
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }

    // Reject anything not signed with exactly HS256 before touching the key.
    let header = jsonwebtoken::decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
    if header.alg != TOKEN_ALGORITHM {
        return Err(TokenError::UnexpectedAlgorithm(header.alg));
    }

    let mut validation = Validation::new(TOKEN_ALGORITHM);
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.set_required_spec_claims(&["exp"]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::InvalidAlgorithm => TokenError::UnexpectedAlgorithm(header.alg),
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Malformed(e.to_string()),
        }
    })?;

    if now.timestamp() >= data.claims.exp {
        return Err(TokenError::Expired);
    }
    if data.claims.user_id.is_empty() {
        return Err(TokenError::MissingUserId);
    }
    Ok(data.claims.user_id)
}

/// Secret plus default validity, shared by every component that checks tokens.
#[derive(Clone)]
pub struct TokenGate {
    secret: Arc<str>,
    validity_hours: i64,
}

impl std::fmt::Debug for TokenGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGate")
            .field("validity_hours", &self.validity_hours)
            .finish_non_exhaustive()
    }
}

impl TokenGate {
    pub fn new(secret: impl Into<Arc<str>>, validity_hours: i64) -> Self {
        Self {
            secret: secret.into(),
            validity_hours,
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, TokenError> {
        issue_token(user_id, &self.secret, self.validity_hours)
    }

    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        verify_token(token, &self.secret)
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, TokenError> {
        verify_token_at(token, &self.secret, now)
    }
}

/// Request-scoped values for one authorized call or connection.
///
/// Created once per successful verification and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    user_id: Option<Arc<str>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Derive a context from `parent` (which may be absent) with `user_id` bound.
pub fn bind_user_id(parent: Option<&RequestContext>, user_id: &str) -> RequestContext {
    let mut ctx = parent.cloned().unwrap_or_default();
    ctx.user_id = Some(Arc::from(user_id));
    ctx
}

/// Read the bound user id. Missing or empty bindings report `None`.
pub fn read_user_id(ctx: Option<&RequestContext>) -> Option<&str> {
    ctx.and_then(RequestContext::user_id)
}

/// Strip an optional case-insensitive `Bearer` prefix and surrounding
/// whitespace from an authorization value.
pub fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer") => {
            let rest = &trimmed[6..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                rest.trim()
            } else {
                trimmed
            }
        }
        _ => trimmed,
    }
}
