//! HTTP middleware: request-ID propagation, request logging, and the
//! mTLS subject gate.
//!
//! Ordering (outermost first): request-ID → mTLS → request logger →
//! auth → handler. The request-ID is preserved when the client sends
//! one, minted otherwise, echoed on the response, and bound into the
//! tracing span so every log line in the request carries it.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;
use uuid::Uuid;

use lmx_domain::config::MtlsMode;
use lmx_domain::Error;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Paths that generate too much noise for per-request logging.
const QUIET_PATHS: &[&str] = &["/healthz", "/admin/events"];

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_id(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", &Uuid::new_v4().simple().to_string()[..16]));

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn request_logger(req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if QUIET_PATHS.contains(&path.as_str()) {
        return next.run(req).await;
    }
    let method = req.method().clone();
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

/// mTLS subject gate. The TLS terminator in front of the server injects
/// the client-certificate subject into a header; modes:
/// - `off`: pass everything.
/// - `optional`: record the subject when present, always allow.
/// - `required`: reject without a subject; with a non-empty allow-list,
///   reject unlisted subjects too.
pub async fn mtls_gate(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let mtls = { state.config.read().security.mtls.clone() };
    if mtls.mode == MtlsMode::Off {
        return next.run(req).await;
    }

    let subject = req
        .headers()
        .get(mtls.client_subject_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match (mtls.mode, subject) {
        (MtlsMode::Optional, Some(subject)) => {
            tracing::debug!(subject = %subject, "mtls subject recorded");
            next.run(req).await
        }
        (MtlsMode::Optional, None) => next.run(req).await,
        (MtlsMode::Required, Some(subject)) => {
            if !mtls.allowed_subjects.is_empty()
                && !mtls.allowed_subjects.iter().any(|s| s == &subject)
            {
                return ApiError(Error::AuthDenied("client subject not allowed".into()))
                    .into_response();
            }
            next.run(req).await
        }
        (MtlsMode::Required, None) => {
            ApiError(Error::AuthDenied("client certificate subject required".into()))
                .into_response()
        }
        (MtlsMode::Off, _) => unreachable!("handled above"),
    }
}
