//! Agent run surface: submit, fetch, cancel, approve.
//!
//! Idempotency: the `Idempotency-Key` header plus a fingerprint of the
//! request body identify a logical submission across retries; the same
//! (key, fingerprint) pair always returns the same run.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use lmx_agents::models::RunStatus;
use lmx_agents::AgentRequest;
use lmx_domain::Error;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Stable fingerprint of a submission body.
fn request_fingerprint(body: &serde_json::Value) -> String {
    let canonical = body.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let request: AgentRequest = serde_json::from_value(body.clone())
        .map_err(|e| ApiError(Error::Validation(format!("agent request: {e}"))))?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let fingerprint = if idempotency_key.is_some() {
        request_fingerprint(&body)
    } else {
        String::new()
    };

    let run = state
        .agents
        .submit(request, idempotency_key, &fingerprint)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<RunStatus>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Json<serde_json::Value> {
    let runs = state.agents.list(query.status);
    Json(serde_json::json!({"runs": runs, "count": runs.len()}))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    let run = state
        .agents
        .get(&run_id)
        .ok_or_else(|| ApiError(Error::ModelNotFound(format!("run {run_id}"))))?;
    Ok(Json(run).into_response())
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    if !state.agents.cancel(&run_id).await {
        return Err(ApiError(Error::ModelNotFound(format!("run {run_id}"))));
    }
    let run = state.agents.get(&run_id);
    Ok(Json(serde_json::json!({"cancelled": run_id, "run": run})).into_response())
}

pub async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    let run = state.agents.approve(&run_id).await?;
    Ok(Json(run).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = serde_json::json!({"input": "x", "roles": ["a"]});
        let b = serde_json::json!({"input": "x", "roles": ["a"]});
        let c = serde_json::json!({"input": "y", "roles": ["a"]});
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
        assert_ne!(request_fingerprint(&a), request_fingerprint(&c));
    }
}
