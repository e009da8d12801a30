//! OpenAI-shaped error responses.
//!
//! Every handler returns `ApiResult<T>`; the conversion here is the only
//! place HTTP statuses and error bodies are built, so the taxonomy in
//! `lmx_domain::Error` stays authoritative. Overload-class errors carry
//! `Retry-After`.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use lmx_domain::Error;

/// `Retry-After` seconds attached to 429 responses.
pub const RETRY_AFTER_SEC: u64 = 5;

pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self(Error::from(error))
    }
}

pub fn error_body(error: &Error) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
            "code": error.code(),
        }
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(error_body(&self.0))).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response.headers_mut().insert(
                "retry-after",
                HeaderValue::from_str(&RETRY_AFTER_SEC.to_string()).expect("static header"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_carries_retry_after() {
        let response = ApiError(Error::Overloaded).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").unwrap(),
            &HeaderValue::from_static("5")
        );
    }

    #[test]
    fn body_is_openai_shaped() {
        let body = error_body(&Error::ModelNotFound("m".into()));
        assert_eq!(body["error"]["code"], "model_not_found");
        assert_eq!(body["error"]["type"], "not_found_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("m"));
    }
}
