//! RAG facade — thin pass-through to the external vector store.
//!
//! The store is a passive collaborator with a declared HTTP interface;
//! we forward bodies verbatim and translate failures into the
//! helper-node error taxonomy (502, no silent degradation).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use lmx_domain::config::HelperFallback;
use lmx_domain::Error;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

fn store_base(state: &AppState) -> ApiResult<String> {
    let base = { state.config.read().rag.base_url.clone() };
    base.ok_or_else(|| {
        ApiError(Error::Validation(
            "RAG is not configured (rag.base_url is unset)".into(),
        ))
    })
}

fn store_error(e: impl std::fmt::Display) -> ApiError {
    ApiError(Error::HelperNode {
        node: "rag".into(),
        message: e.to_string(),
        fallback: HelperFallback::Skip,
    })
}

async fn forward(
    state: &AppState,
    method: reqwest::Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> ApiResult<Response> {
    let base = store_base(state)?;
    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let mut request = state.rag_http.request(method, &url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.map_err(store_error)?;
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let payload: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    Ok((status, Json(payload)).into_response())
}

pub async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward(&state, reqwest::Method::POST, "/ingest", Some(body)).await
}

pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward(&state, reqwest::Method::POST, "/query", Some(body)).await
}

pub async fn context(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward(&state, reqwest::Method::POST, "/context", Some(body)).await
}

pub async fn list_collections(State(state): State<AppState>) -> ApiResult<Response> {
    forward(&state, reqwest::Method::GET, "/collections", None).await
}

pub async fn delete_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    forward(
        &state,
        reqwest::Method::DELETE,
        &format!("/collections/{name}"),
        None,
    )
    .await
}
