//! Admin control plane: model lifecycle, downloads, memory, status,
//! benchmarks, metrics, presets, diagnostics, helpers, compatibility,
//! autotune, quantize, the server event stream, and config reload.
//!
//! Model-scoped operations take the model ID in the request body or
//! query string (repo IDs contain `/` and do not survive as path
//! segments).

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use lmx_domain::chat::{ChatMessage, Priority, SamplingParams};
use lmx_domain::config::Config;
use lmx_domain::events::ServerEvent;
use lmx_domain::Error;
use lmx_engine::backend::BackendKind;
use lmx_engine::engine::{LoadOptions, LoadOutcome};

use crate::api::auth::hash_key;
use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Models: list / load / confirm / unload / delete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let loaded = state.engine.list_infos();
    let cached = state.engine.manager().list()?;
    Ok(Json(serde_json::json!({
        "loaded": loaded,
        "cached": cached,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    #[serde(default)]
    pub auto_download: Option<bool>,
    #[serde(default)]
    pub performance: HashMap<String, serde_json::Value>,
}

pub async fn load_model(
    State(state): State<AppState>,
    Json(body): Json<LoadModelRequest>,
) -> ApiResult<Response> {
    let outcome = state
        .engine
        .load(
            &body.model_id,
            LoadOptions {
                performance: body.performance,
                preset_performance: HashMap::new(),
                auto_download: body.auto_download,
            },
        )
        .await?;

    Ok(match outcome {
        LoadOutcome::Loaded { info } => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "loaded", "model": info})),
        )
            .into_response(),
        LoadOutcome::DownloadRequired {
            model_id,
            confirmation_token,
            estimated_size_bytes,
        } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "download_required",
                "model_id": model_id,
                "estimated_size_bytes": estimated_size_bytes,
                "confirmation_token": confirmation_token,
                "confirm_url": "/admin/models/load/confirm",
            })),
        )
            .into_response(),
        LoadOutcome::Downloading {
            model_id,
            download_id,
        } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "downloading",
                "model_id": model_id,
                "download_id": download_id,
                "progress_url": format!("/admin/models/download/{download_id}/progress"),
            })),
        )
            .into_response(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ConfirmDownloadRequest {
    pub confirmation_token: String,
}

pub async fn confirm_download(
    State(state): State<AppState>,
    Json(body): Json<ConfirmDownloadRequest>,
) -> ApiResult<Response> {
    let task = state.engine.confirm_download(&body.confirmation_token).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "downloading",
            "download_id": task.download_id,
            "progress_url": format!("/admin/models/download/{}/progress", task.download_id),
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ModelIdRequest {
    pub model_id: String,
}

pub async fn unload_model(
    State(state): State<AppState>,
    Json(body): Json<ModelIdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.unload(&body.model_id).await?;
    Ok(Json(serde_json::json!({"status": "unloaded", "model_id": body.model_id})))
}

pub async fn delete_model(
    State(state): State<AppState>,
    Json(body): Json<ModelIdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.delete_model(&body.model_id)?;
    Ok(Json(serde_json::json!({"status": "deleted", "model_id": body.model_id})))
}

pub async fn download_progress(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = state
        .engine
        .manager()
        .get_download(&download_id)
        .ok_or(Error::DownloadNotFound(download_id))?;
    Ok(Json(serde_json::to_value(task)?))
}

pub async fn list_downloads(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"downloads": state.engine.manager().list_downloads()}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Probe / performance / quarantine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn probe_model(
    State(state): State<AppState>,
    Json(body): Json<ModelIdRequest>,
) -> Json<serde_json::Value> {
    let preference: Vec<BackendKind> = {
        state
            .config
            .read()
            .models
            .backend_preference
            .iter()
            .filter_map(|name| BackendKind::parse(name))
            .collect()
    };
    let candidates = state
        .engine
        .compat()
        .candidate_backends(&body.model_id, &preference);
    Json(serde_json::json!({
        "model_id": body.model_id,
        "on_disk": state.engine.manager().is_available(&body.model_id),
        "loaded": state.engine.is_loaded(&body.model_id),
        "candidate_backends": candidates,
        "quarantined": preference
            .iter()
            .filter(|kind| state.engine.compat().is_quarantined(&body.model_id, **kind))
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ModelIdQuery {
    pub model_id: String,
}

/// Resolved backend kind/version and the effective performance profile.
pub async fn model_performance(
    State(state): State<AppState>,
    Query(query): Query<ModelIdQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let info = state
        .engine
        .get_info(&query.model_id)
        .ok_or(Error::ModelNotFound(query.model_id))?;
    Ok(Json(serde_json::json!({
        "model_id": info.model_id,
        "backend": info.backend,
        "backend_version": info.backend_version,
        "performance": info.performance,
        "speculative": info.speculative,
        "context_length": info.context_length,
    })))
}

#[derive(Debug, Deserialize)]
pub struct QuarantineRequest {
    pub model_id: String,
    #[serde(default = "d_reason")]
    pub reason: String,
}

fn d_reason() -> String {
    "manual quarantine".to_string()
}

pub async fn quarantine_model(
    State(state): State<AppState>,
    Json(body): Json<QuarantineRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.quarantine(&body.model_id, &body.reason)?;
    Ok(Json(serde_json::json!({"status": "quarantined", "model_id": body.model_id})))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Benchmark / autotune / quantize
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct BenchmarkRequest {
    pub model_id: String,
    #[serde(default = "d_bench_prompt")]
    pub prompt: String,
    #[serde(default = "d_bench_tokens")]
    pub max_tokens: u32,
}

fn d_bench_prompt() -> String {
    "Write a paragraph about the speed of light.".to_string()
}

fn d_bench_tokens() -> u32 {
    128
}

async fn run_benchmark(
    state: &AppState,
    body: &BenchmarkRequest,
) -> ApiResult<serde_json::Value> {
    let params = SamplingParams {
        max_tokens: Some(body.max_tokens),
        ..Default::default()
    };
    let started = Instant::now();
    let completion = state
        .engine
        .generate(
            &body.model_id,
            &[ChatMessage::user(body.prompt.clone())],
            &params,
            Priority::High,
            Some("admin-benchmark"),
        )
        .await?;
    let elapsed = started.elapsed().as_secs_f64();
    let tokens_per_sec = if elapsed > 0.0 {
        completion.usage.completion_tokens as f64 / elapsed
    } else {
        0.0
    };
    let speculative = state.engine.metrics().speculative_for(&body.model_id);
    Ok(serde_json::json!({
        "model_id": body.model_id,
        "elapsed_sec": elapsed,
        "completion_tokens": completion.usage.completion_tokens,
        "tokens_per_sec": tokens_per_sec,
        "speculative": speculative,
    }))
}

pub async fn benchmark_model(
    State(state): State<AppState>,
    Json(body): Json<BenchmarkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(run_benchmark(&state, &body).await?))
}

/// Derives a suggested performance profile from a benchmark pass. Apply
/// is a reload hint only; nothing is mutated here.
pub async fn autotune_model(
    State(state): State<AppState>,
    Json(body): Json<BenchmarkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let benchmark = run_benchmark(&state, &body).await?;
    let tokens_per_sec = benchmark["tokens_per_sec"].as_f64().unwrap_or(0.0);

    // Slow decode favors a tighter KV cache; fast decode favors prefix
    // reuse for multi-turn serving.
    let suggested = if tokens_per_sec < 20.0 {
        serde_json::json!({"kv_bits": 4, "kv_group_size": 64, "prefix_cache": true})
    } else {
        serde_json::json!({"prefix_cache": true})
    };
    Ok(Json(serde_json::json!({
        "benchmark": benchmark,
        "suggested_performance": suggested,
        "apply": "reload the model with these keys under models.overrides",
    })))
}

#[derive(Debug, Deserialize)]
pub struct QuantizeRequest {
    pub model_id: String,
    #[serde(default = "d_q4")]
    pub target_format: String,
}

fn d_q4() -> String {
    "q4".to_string()
}

pub async fn start_quantize(
    State(state): State<AppState>,
    Json(body): Json<QuantizeRequest>,
) -> ApiResult<Response> {
    if !state.engine.manager().is_available(&body.model_id) {
        return Err(ApiError(Error::ModelNotFound(body.model_id)));
    }
    let command = { state.config.read().models.quantize_command.clone() };
    let job = state
        .quantize_jobs
        .start(&body.model_id, &body.target_format, command);
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

pub async fn quantize_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state
        .quantize_jobs
        .get(&job_id)
        .ok_or_else(|| Error::DownloadNotFound(format!("quantize job {job_id}")))?;
    Ok(Json(serde_json::to_value(job)?))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory / status / metrics / diagnostics / stack
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn memory(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.engine.monitor().refresh();
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let controller = state.engine.controller();
    Json(serde_json::json!({
        "uptime_sec": state.uptime_sec(),
        "loaded_models": state.engine.loaded_ids(),
        "in_flight": controller.in_flight_count(),
        "waiting": controller.waiting_queue_count(),
        "concurrency_limit": controller.current_limit(),
        "memory": state.engine.monitor().snapshot(),
        "pending_confirmations": state.engine.pending_confirmation_count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub format: Option<String>,
}

pub async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    if query.format.as_deref() == Some("json") {
        return Json(state.engine.metrics().json_view()).into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().prometheus_view(),
    )
        .into_response()
}

pub async fn diagnostics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let controller = state.engine.controller();
    let helpers: Vec<serde_json::Value> = state
        .helpers
        .iter()
        .map(|helper| {
            serde_json::json!({
                "id": helper.id(),
                "kind": helper.kind(),
                "breaker": helper.breaker_state(),
            })
        })
        .collect();
    Json(serde_json::json!({
        "concurrency": {
            "in_flight": controller.in_flight_count(),
            "waiting": controller.waiting_queue_count(),
            "current_limit": controller.current_limit(),
            "configured_max": controller.configured_max(),
            "latency_p95_sec": controller.latency_p95_sec(),
            "last_adapt_reason": controller.last_adapt_reason(),
        },
        "models": state.engine.list_infos(),
        "memory": state.engine.monitor().snapshot(),
        "helpers": helpers,
        "quantize_jobs": state.quantize_jobs.list(),
        "downloads": state.engine.manager().list_downloads(),
    }))
}

pub async fn stack(State(state): State<AppState>) -> Json<serde_json::Value> {
    let helper_ids: Vec<&str> = state.helpers.iter().map(|h| h.id()).collect();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "loaded_models": state.engine.loaded_ids(),
        "presets": state.presets.list().iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
        "helpers": helper_ids,
        "skills": state.skills.list().len(),
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presets / helpers / compatibility
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_presets(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"presets": state.presets.list()}))
}

pub async fn reload_presets(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let count = state.presets.reload()?;
    Ok(Json(serde_json::json!({"status": "reloaded", "count": count})))
}

pub async fn list_helpers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let helpers: Vec<serde_json::Value> = state
        .helpers
        .iter()
        .map(|helper| {
            serde_json::json!({
                "id": helper.id(),
                "kind": helper.kind(),
                "fallback": helper.fallback(),
                "breaker": helper.breaker_state(),
            })
        })
        .collect();
    Json(serde_json::json!({"helpers": helpers}))
}

pub async fn probe_helper(
    State(state): State<AppState>,
    Path(helper_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let helper = state
        .helpers
        .get(&helper_id)
        .ok_or_else(|| Error::ModelNotFound(format!("helper {helper_id}")))?;
    let healthy = helper.health_check().await;
    Ok(Json(serde_json::json!({
        "id": helper_id,
        "healthy": healthy,
        "breaker": helper.breaker_state(),
    })))
}

pub async fn compatibility(
    State(state): State<AppState>,
    Query(query): Query<ModelIdQuery>,
) -> Json<serde_json::Value> {
    let records = state.engine.compat().records_for(&query.model_id);
    Json(serde_json::json!({
        "model_id": query.model_id,
        "records": records,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events (SSE with heartbeat)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let mut receiver = state.engine.events().subscribe();
    let heartbeat_interval = {
        std::time::Duration::from_secs(state.config.read().server.sse_heartbeat_interval_sec.max(1))
    };

    let stream = async_stream::stream! {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // immediate first tick consumed
        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Ok(event) => {
                            let data = serde_json::to_string(&event).unwrap_or_default();
                            yield Ok::<_, std::convert::Infallible>(
                                Event::default().event(event.name()).data(data),
                            );
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "admin event subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    let event = ServerEvent::Heartbeat { timestamp: Utc::now() };
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event("heartbeat").data(data));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config reload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Re-reads the config file and applies the hot-reloadable subset:
/// routing, memory threshold, admin key, logging level, presets.
pub async fn reload_config(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let Some(path) = &state.config_path else {
        return Err(ApiError(Error::Validation(
            "server was started without a config file".into(),
        )));
    };
    let fresh = Config::load(path)?;
    let mut changed = Vec::new();

    {
        let current = state.config.read();
        if fresh.routing.aliases != current.routing.aliases
            || fresh.routing.default_model != current.routing.default_model
        {
            changed.push("routing".to_string());
        }
        if fresh.memory.threshold_pct != current.memory.threshold_pct {
            changed.push("memory.threshold_pct".to_string());
        }
        if fresh.security.admin_key != current.security.admin_key {
            changed.push("security.admin_key".to_string());
        }
        if fresh.logging.level != current.logging.level {
            changed.push("logging.level".to_string());
        }
    }

    *state.router.write() = lmx_engine::router::TaskRouter::from_config(&fresh.routing);
    state
        .engine
        .monitor()
        .set_threshold_pct(fresh.memory.threshold_pct);
    let admin_key = std::env::var("LMX_ADMIN_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| fresh.security.admin_key.clone());
    *state.admin_key_hash.write() = admin_key.map(|k| hash_key(&k));
    if let Some(reload) = &state.log_filter_reload {
        reload(&fresh.logging.level);
    }
    let preset_count = state.presets.reload()?;

    *state.config.write() = fresh;
    state
        .engine
        .events()
        .publish(ServerEvent::ConfigReloaded {
            changed: changed.clone(),
        });
    Ok(Json(serde_json::json!({
        "status": "reloaded",
        "changed": changed,
        "presets": preset_count,
    })))
}
