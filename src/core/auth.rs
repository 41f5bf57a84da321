//! Bearer-token authentication for duplex sessions
//!
//! Token issuance and key management live outside the core. The core only
//! needs "token in, verified user ID out", which is what [`TokenValidator`]
//! expresses. Tokens arrive either as an `Authorization: Bearer` header or,
//! for browsers that cannot set headers on upgrade requests, as a `token`
//! query parameter.

use crate::core::error::RealtimeError;
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use std::collections::HashMap;
use std::sync::RwLock;

/// Validates a bearer token and yields the authenticated user ID
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, RealtimeError>;
}

/// Token table validator
///
/// Useful for tests and local development. Every token maps to exactly one
/// user; unknown tokens fail with `AuthFailed`.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a user
    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.into(), user_id.into());
    }

    /// Builder-style variant of [`insert`](Self::insert)
    pub fn with_token(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.insert(token, user_id);
        self
    }

    pub fn revoke(&self, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, RealtimeError> {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned()
            .ok_or_else(|| RealtimeError::auth_failed("invalid or expired token"))
    }
}

/// Extract the bearer token from the request
///
/// The `Authorization` header wins over the query parameter.
pub fn extract_bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());

    from_header
        .or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def"),
        );
        assert_eq!(
            extract_bearer_token(&headers, Some("query-token")),
            Some("abc.def".to_string())
        );
    }

    #[test]
    fn test_extract_falls_back_to_query() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_bearer_token(&headers, Some("query-token")),
            Some("query-token".to_string())
        );
    }

    #[test]
    fn test_extract_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_bearer_token(&headers, None), None);
        assert_eq!(extract_bearer_token(&HeaderMap::new(), Some("  ")), None);
    }

    #[tokio::test]
    async fn test_static_validator() {
        let validator = StaticTokenValidator::new().with_token("t-1", "user-1");
        assert_eq!(validator.validate("t-1").await.unwrap(), "user-1");

        validator.revoke("t-1");
        assert!(matches!(
            validator.validate("t-1").await,
            Err(RealtimeError::AuthFailed { .. })
        ));
    }
}
