//! Shared-secret authorization extractors.
//!
//! Control routes take the key from the `x-api-key` header. Streaming routes
//! are opened by clients that cannot set headers, so they also accept the
//! `apiKey` query parameter.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Proof that a control request carried the shared secret.
#[derive(Debug, Clone, Copy)]
pub struct ControlAuth;

/// Proof that a streaming request carried the shared secret.
#[derive(Debug, Clone, Copy)]
pub struct StreamAuth;

#[derive(Debug, Deserialize)]
struct KeyParam {
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
}

fn header_key(parts: &Parts) -> Option<&str> {
    parts.headers.get(API_KEY_HEADER)?.to_str().ok()
}

fn query_key(parts: &Parts) -> Option<String> {
    Query::<KeyParam>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(param)| param.api_key)
}

/// Keys are compared as digests with a full-length fold, so the time taken
/// depends neither on the given key's length nor on its first mismatch.
fn matches(expected: &str, given: Option<&str>) -> bool {
    let Some(given) = given else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    digests_equal(expected.as_bytes(), given.as_bytes())
}

fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl FromRequestParts<AppState> for ControlAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if matches(&state.api_key, header_key(parts)) {
            Ok(ControlAuth)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

impl FromRequestParts<AppState> for StreamAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let query = query_key(parts);
        if matches(&state.api_key, query.as_deref()) || matches(&state.api_key, header_key(parts)) {
            Ok(StreamAuth)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_never_matches() {
        assert!(!matches("", Some("")));
        assert!(!matches("", None));
        assert!(matches("k", Some("k")));
        assert!(!matches("k", Some("K")));
    }

    #[test]
    fn test_near_miss_keys_are_rejected() {
        let key = "0123456789abcdef";
        assert!(matches(key, Some(key)));
        assert!(!matches(key, Some("1123456789abcdef")));
        assert!(!matches(key, Some("0123456789abcdee")));
        assert!(!matches(key, Some("0123456789abcde")));
        assert!(!matches(key, Some("0123456789abcdef0")));
        assert!(!matches(key, Some("")));
    }

    #[test]
    fn test_digest_comparison_is_exact() {
        assert!(digests_equal(b"secret", b"secret"));
        assert!(!digests_equal(b"secret", b"secreT"));
        assert!(!digests_equal(b"", b"\0"));
    }

    #[test]
    fn test_query_key_is_read_from_uri() {
        let (parts, _) = axum::http::Request::builder()
            .uri("/api/docker?buildId=1&apiKey=secret")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(query_key(&parts).as_deref(), Some("secret"));
    }
}
