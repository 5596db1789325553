//! Caller identity and agent token checks.
//!
//! API and terminal callers identify themselves with `x-berth-user`; the
//! deployment in front of berth is expected to set it. Agents authenticate
//! with a bearer token whose SHA-256 digest is listed in `[agent] tokens`.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

pub const USER_HEADER: &str = "x-berth-user";

/// Lowercase hex SHA-256 of an agent token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// `Authorization: Bearer <token>`, if present and non-empty.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// User id for an agent token, looked up by digest.
pub fn agent_user(tokens: &HashMap<String, String>, token: &str) -> Option<String> {
    tokens.get(&hash_token(token)).cloned()
}

/// Caller identity from `x-berth-user`. Absent is allowed; the access
/// policy decides what an anonymous caller may do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller(pub Option<String>);

impl Caller {
    pub fn id(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let user = headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Caller(user)
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_headers(&parts.headers))
    }
}
