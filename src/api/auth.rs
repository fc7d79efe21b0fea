use axum::extract::Query;
use axum::http::{header, HeaderMap, Uri};
use serde::Deserialize;

use crate::auth::strip_bearer;

/// What the `Authorization` header of a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Credential<'a> {
    /// No header (or a header that is not valid text).
    Missing,
    /// Header present but nothing left after removing the `Bearer` prefix.
    Empty,
    Token(&'a str),
}

/// Extract a bearer token from the Authorization header.
pub(crate) fn extract_bearer(headers: &HeaderMap) -> Credential<'_> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Credential::Missing;
    };
    let Ok(value) = value.to_str() else {
        return Credential::Missing;
    };
    match strip_bearer(value) {
        "" => Credential::Empty,
        token => Credential::Token(token),
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    id: Option<String>,
}

/// Extract the `?id=` session id from a request URI.
pub(crate) fn extract_session_id(uri: &Uri) -> Option<String> {
    Query::<SessionQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.id)
        .filter(|id| !id.is_empty())
}
