//! Skills registry surface plus the MCP adapter.
//!
//! `/v1/skills/*` registers, lists, and executes skill manifests through
//! the configured dispatcher. `/mcp/*` exposes the same registry in
//! MCP tool-listing / tool-call form so MCP clients can drive skills
//! without a separate integration.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use lmx_domain::Error;
use lmx_skills::dispatch::SkillDispatcher;
use lmx_skills::executor::Arguments;
use lmx_skills::manifest::SkillManifest;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// /v1/skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn register_skill(
    State(state): State<AppState>,
    Json(manifest): Json<SkillManifest>,
) -> ApiResult<Response> {
    let qualified = manifest.qualified_name();
    state.skills.register(manifest)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"registered": qualified})),
    )
        .into_response())
}

pub async fn list_skills(State(state): State<AppState>) -> Json<serde_json::Value> {
    let skills = state.skills.list();
    Json(serde_json::json!({"skills": skills, "count": skills.len()}))
}

pub async fn get_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<SkillManifest>> {
    state
        .skills
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError(Error::ModelNotFound(format!("skill {name}"))))
}

pub async fn remove_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.skills.remove(&name) {
        return Err(ApiError(Error::ModelNotFound(format!("skill {name}"))));
    }
    Ok(Json(serde_json::json!({"removed": name})))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteSkillRequest {
    pub skill: String,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub timeout_sec: Option<f64>,
}

pub async fn execute_skill(
    State(state): State<AppState>,
    Json(body): Json<ExecuteSkillRequest>,
) -> ApiResult<Response> {
    let manifest = state
        .skills
        .get(&body.skill)
        .ok_or_else(|| ApiError(Error::ModelNotFound(format!("skill {}", body.skill))))?;
    let timeout = body.timeout_sec.map(Duration::from_secs_f64);
    let result = state
        .skill_dispatcher
        .execute(&manifest, body.arguments, body.approved, timeout)
        .await?;
    Ok(Json(result).into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// /mcp — tools/list and tools/call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn mcp_tools_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools: Vec<serde_json::Value> = state
        .skills
        .list()
        .into_iter()
        .map(|manifest| {
            serde_json::json!({
                "name": manifest.qualified_name(),
                "description": manifest.description,
                "inputSchema": manifest.input_schema,
            })
        })
        .collect();
    Json(serde_json::json!({"tools": tools}))
}

#[derive(Debug, Deserialize)]
pub struct McpToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Arguments,
}

pub async fn mcp_tools_call(
    State(state): State<AppState>,
    Json(body): Json<McpToolCall>,
) -> ApiResult<Response> {
    let manifest = state
        .skills
        .get(&body.name)
        .ok_or_else(|| ApiError(Error::ModelNotFound(format!("tool {}", body.name))))?;
    let result = state
        .skill_dispatcher
        .execute(&manifest, body.arguments, false, None)
        .await?;

    if result.requires_approval {
        return Err(ApiError(Error::Validation(
            "tool requires approval and cannot run through the MCP surface".into(),
        )));
    }
    let content_text = match &result.output {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => result.error.clone().unwrap_or_default(),
    };
    Ok(Json(serde_json::json!({
        "content": [{"type": "text", "text": content_text}],
        "isError": !result.ok,
    }))
    .into_response())
}
