//! Key authentication for the admin and inference surfaces.
//!
//! Keys are hashed once (SHA-256) and compared in constant time so
//! neither content nor length leaks. An absent key disables the
//! corresponding gate.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use lmx_domain::Error;

use crate::api::error::ApiError;
use crate::state::AppState;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

pub fn hash_key(key: &str) -> Vec<u8> {
    Sha256::digest(key.as_bytes()).to_vec()
}

fn key_matches(provided: &str, expected_hash: &[u8]) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(expected_hash))
}

/// `X-Admin-Key` gate on `/admin/*`.
pub async fn require_admin_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected = { state.admin_key_hash.read().clone() };
    let Some(expected) = expected else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !key_matches(provided, &expected) {
        return ApiError(Error::AuthDenied("invalid or missing admin key".into()))
            .into_response();
    }
    next.run(req).await
}

/// Optional bearer-token gate on `/v1/*`.
pub async fn require_inference_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.inference_key_hash else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if !key_matches(provided, expected) {
        return ApiError(Error::AuthDenied("invalid or missing API key".into()))
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_compare_roundtrip() {
        let expected = hash_key("secret");
        assert!(key_matches("secret", &expected));
        assert!(!key_matches("Secret", &expected));
        assert!(!key_matches("", &expected));
        // Different lengths never match and never panic.
        assert!(!key_matches("a-much-longer-candidate-key", &expected));
    }
}
