pub mod admin;
pub mod agents;
pub mod anthropic;
pub mod auth;
pub mod chat;
pub mod error;
pub mod middleware;
pub mod rag;
pub mod skills;
pub mod ws;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::state::AppState;

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the full API router.
///
/// Middleware order (outermost first): request-ID → mTLS gate → request
/// logger → per-surface auth → handler. The per-IP rate limit wraps only
/// `/v1/chat/completions`.
pub fn router(state: AppState) -> Router<AppState> {
    // ── Rate limit on chat completions ────────────────────────────────
    let governor_layer = {
        let config = state.config.read();
        config.server.rate_limit.as_ref().map(|rl| {
            use tower_governor::governor::GovernorConfigBuilder;
            use tower_governor::GovernorLayer;

            let gov_config = GovernorConfigBuilder::default()
                .per_second(rl.requests_per_second)
                .burst_size(rl.burst_size)
                .finish()
                .expect("rate_limit: requests_per_second and burst_size must be > 0");
            tracing::info!(
                requests_per_second = rl.requests_per_second,
                burst_size = rl.burst_size,
                "per-IP rate limiting enabled on chat completions"
            );
            GovernorLayer {
                config: std::sync::Arc::new(gov_config),
            }
        })
    };

    let mut chat_completions =
        Router::new().route("/v1/chat/completions", post(chat::chat_completions));
    if let Some(governor) = governor_layer {
        chat_completions = chat_completions.layer(governor);
    }

    // ── Inference surface ─────────────────────────────────────────────
    let v1 = Router::new()
        .merge(chat_completions)
        .route("/v1/completions", post(chat::legacy_completions))
        .route("/v1/responses", post(chat::responses))
        .route("/v1/models", get(chat::list_models))
        // Repo-style model IDs contain slashes; capture the rest.
        .route("/v1/models/*id", get(chat::get_model))
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/chat/stream", get(ws::chat_stream))
        // RAG facade
        .route("/v1/rag/ingest", post(rag::ingest))
        .route("/v1/rag/query", post(rag::query))
        .route("/v1/rag/context", post(rag::context))
        .route("/v1/rag/collections", get(rag::list_collections))
        .route("/v1/rag/collections/:name", delete(rag::delete_collection))
        // Skills + MCP adapter
        .route(
            "/v1/skills",
            get(skills::list_skills).post(skills::register_skill),
        )
        .route("/v1/skills/execute", post(skills::execute_skill))
        .route(
            "/v1/skills/:name",
            get(skills::get_skill).delete(skills::remove_skill),
        )
        .route("/mcp/tools/list", post(skills::mcp_tools_list))
        .route("/mcp/tools/call", post(skills::mcp_tools_call))
        // Agents
        .route("/v1/agents", post(agents::submit).get(agents::list_runs))
        .route("/v1/agents/:id", get(agents::get_run))
        .route("/v1/agents/:id/cancel", post(agents::cancel_run))
        .route("/v1/agents/:id/approve", post(agents::approve_run))
        .route_layer(from_fn_with_state(
            state.clone(),
            auth::require_inference_key,
        ));

    // ── Admin plane ───────────────────────────────────────────────────
    let admin = Router::new()
        .route("/admin/models", get(admin::list_models))
        .route("/admin/models/load", post(admin::load_model))
        .route("/admin/models/load/confirm", post(admin::confirm_download))
        .route("/admin/models/unload", post(admin::unload_model))
        .route("/admin/models/delete", post(admin::delete_model))
        .route("/admin/models/downloads", get(admin::list_downloads))
        .route(
            "/admin/models/download/:id/progress",
            get(admin::download_progress),
        )
        .route("/admin/models/probe", post(admin::probe_model))
        .route("/admin/models/performance", get(admin::model_performance))
        .route("/admin/models/quarantine", post(admin::quarantine_model))
        .route("/admin/models/benchmark", post(admin::benchmark_model))
        .route("/admin/models/autotune", post(admin::autotune_model))
        .route("/admin/models/quantize", post(admin::start_quantize))
        .route("/admin/models/quantize/:id", get(admin::quantize_status))
        .route("/admin/memory", get(admin::memory))
        .route("/admin/status", get(admin::status))
        .route("/admin/metrics", get(admin::metrics))
        .route("/admin/presets", get(admin::list_presets))
        .route("/admin/presets/reload", post(admin::reload_presets))
        .route("/admin/stack", get(admin::stack))
        .route("/admin/diagnostics", get(admin::diagnostics))
        .route("/admin/helpers", get(admin::list_helpers))
        .route("/admin/helpers/:id/probe", post(admin::probe_helper))
        .route("/admin/compatibility", get(admin::compatibility))
        .route("/admin/events", get(admin::events))
        .route("/admin/config/reload", post(admin::reload_config))
        .route_layer(from_fn_with_state(state.clone(), auth::require_admin_key));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(v1)
        .merge(admin)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(from_fn(middleware::request_logger))
        .layer(from_fn_with_state(state, middleware::mtls_gate))
        .layer(from_fn(middleware::request_id))
}
