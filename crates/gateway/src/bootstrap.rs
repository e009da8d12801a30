//! Component bring-up, in dependency order.
//!
//! Everything that used to be a process-wide singleton lives here as an
//! explicitly-constructed component wired into [`AppState`]. Background
//! loops (memory poll, adaptive concurrency, idle eviction) are spawned
//! at the end so they only observe fully-built state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;

use lmx_agents::runtime::{EngineHandle, RuntimeOptions};
use lmx_agents::tracing_ext::LogTracer;
use lmx_agents::{AgentsRuntime, AgentsStateStore, RunScheduler};
use lmx_domain::config::Config;
use lmx_engine::backend::BackendFactory;
use lmx_engine::compat::CompatibilityRegistry;
use lmx_engine::engine::EngineOptions;
use lmx_engine::events::EventBus;
use lmx_engine::http_backend::HttpBackendFactory;
use lmx_engine::manager::ModelManager;
use lmx_engine::memory::MemoryMonitor;
use lmx_engine::metrics::MetricsCollector;
use lmx_engine::presets::PresetManager;
use lmx_engine::router::TaskRouter;
use lmx_engine::{ConcurrencyController, ControllerOptions, InferenceEngine};
use lmx_helpers::HelperNodeRegistry;
use lmx_skills::dispatch::{LocalSkillDispatcher, QueuedSkillDispatcher, SkillDispatcher};
use lmx_skills::executor::{Arguments, EntrypointRegistry, SkillExecutor};
use lmx_skills::manifest::SkillRegistry;
use lmx_skills::SkillsPolicy;

use crate::api::auth::hash_key;
use crate::quantize::QuantizeJobs;
use crate::state::AppState;

/// Built-in entrypoint handlers. Deployments extend this table from
/// their own bring-up code; skills can only reference what is registered.
fn register_builtin_entrypoints(entrypoints: &EntrypointRegistry) {
    entrypoints.register("builtin.text:echo", |args: Arguments| async move {
        Ok(args
            .get("value")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    });
    entrypoints.register("builtin.time:now", |_args: Arguments| async move {
        Ok(serde_json::json!(chrono::Utc::now().to_rfc3339()))
    });
}

pub async fn build_state(
    config: Config,
    config_path: Option<PathBuf>,
    log_filter_reload: Option<Arc<dyn Fn(&str) + Send + Sync>>,
) -> anyhow::Result<AppState> {
    // ── Concurrency controller ────────────────────────────────────────
    let controller = Arc::new(ConcurrencyController::new(ControllerOptions::from_config(
        &config.server,
        &config.models.per_model_concurrency,
    )));
    tracing::info!(
        max_concurrent = controller.configured_max(),
        "concurrency controller ready"
    );

    // ── Memory monitor ────────────────────────────────────────────────
    let monitor = Arc::new(MemoryMonitor::new(
        config.memory.threshold_pct,
        Duration::from_secs(config.memory.poll_interval_sec),
    ));
    monitor.spawn_poll_loop();
    tracing::info!(
        threshold_pct = config.memory.threshold_pct,
        "memory monitor ready"
    );

    // ── Metrics + events ──────────────────────────────────────────────
    let metrics = Arc::new(MetricsCollector::new());
    let events = Arc::new(EventBus::new(256));

    // ── Compatibility registry ────────────────────────────────────────
    let compat = Arc::new(CompatibilityRegistry::new(Some(
        config.models.models_directory.join("compatibility.jsonl"),
    )));

    // ── Model manager ─────────────────────────────────────────────────
    let hub_token = std::env::var(&config.models.hub_token_env)
        .ok()
        .filter(|token| !token.is_empty());
    let manager = Arc::new(
        ModelManager::new(
            config.models.models_directory.clone(),
            config.models.hub_base_url.clone(),
            hub_token,
        )
        .context("initializing model manager")?,
    );
    tracing::info!(
        models_directory = %config.models.models_directory.display(),
        "model manager ready"
    );

    // ── Backend factory + engine ──────────────────────────────────────
    let factory: Arc<dyn BackendFactory> = Arc::new(
        HttpBackendFactory::from_config(
            &config.models.backends,
            Duration::from_secs_f64(config.server.inference_timeout_sec),
        )
        .context("initializing backend factory")?,
    );
    let engine = Arc::new(InferenceEngine::new(
        EngineOptions::from_config(&config),
        factory,
        controller.clone(),
        monitor.clone(),
        metrics.clone(),
        compat,
        manager,
        events,
    ));
    engine.spawn_idle_eviction();
    tracing::info!("inference engine ready");

    // ── Adaptive concurrency loop ─────────────────────────────────────
    {
        let controller = controller.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let snapshot = monitor.snapshot();
                controller.adapt(snapshot.used_pct, monitor.threshold_pct());
            }
        });
    }

    // ── Router + presets ──────────────────────────────────────────────
    let router = Arc::new(RwLock::new(TaskRouter::from_config(&config.routing)));
    let presets = Arc::new(PresetManager::new(config.presets.directory.clone()));
    tracing::info!(presets = presets.len(), "preset manager ready");

    // ── Skills ────────────────────────────────────────────────────────
    let skills = Arc::new(SkillRegistry::new());
    let entrypoints = Arc::new(EntrypointRegistry::new());
    register_builtin_entrypoints(&entrypoints);
    let executor = Arc::new(SkillExecutor::from_config(
        &config.skills,
        SkillsPolicy::from_config(&config.sandbox),
        entrypoints,
    ));
    let skill_dispatcher: Arc<dyn SkillDispatcher> =
        if config.skills.dispatcher.mode.eq_ignore_ascii_case("queued") {
            let dispatcher =
                QueuedSkillDispatcher::start(executor, &config.skills.dispatcher)
                    .context("starting queued skill dispatcher")?;
            tracing::info!(
                backend = ?config.skills.dispatcher.backend,
                workers = config.skills.dispatcher.worker_count,
                "queued skill dispatcher ready"
            );
            dispatcher
        } else {
            Arc::new(LocalSkillDispatcher::new(executor))
        };

    // ── Helper nodes ──────────────────────────────────────────────────
    let helpers = Arc::new(
        HelperNodeRegistry::from_config(&config.helper_nodes)
            .context("initializing helper nodes")?,
    );
    if !helpers.is_empty() {
        tracing::info!(count = helpers.len(), "helper node clients ready");
    }

    // ── Agents ────────────────────────────────────────────────────────
    let state_store = Arc::new(
        AgentsStateStore::open(config.agents.state_path.clone())
            .context("opening agents state store")?,
    );
    let scheduler = Arc::new(
        RunScheduler::new(&config.agents.scheduler).context("initializing run scheduler")?,
    );
    let engine_handle: Arc<dyn EngineHandle> = engine.clone();
    let agents = Arc::new(
        AgentsRuntime::new(
            engine_handle,
            router.clone(),
            Arc::new(LogTracer),
            Some(metrics),
            state_store,
            scheduler,
            RuntimeOptions::from_config(&config.agents),
        )
        .context("initializing agents runtime")?,
    );
    agents.start();
    tracing::info!("agents runtime ready");

    // ── RAG facade client ─────────────────────────────────────────────
    let rag_http = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(config.rag.timeout_sec))
        .build()
        .context("building RAG http client")?;

    // ── Keys (env overrides config; hashed once) ──────────────────────
    let admin_key = std::env::var("LMX_ADMIN_KEY")
        .ok()
        .filter(|key| !key.is_empty())
        .or_else(|| config.security.admin_key.clone());
    if admin_key.is_none() {
        tracing::warn!("admin key not set — /admin endpoints are unauthenticated");
    }
    let inference_key_hash = config
        .security
        .inference_key
        .as_ref()
        .map(|key| hash_key(key));

    Ok(AppState {
        admin_key_hash: Arc::new(RwLock::new(admin_key.map(|key| hash_key(&key)))),
        inference_key_hash,
        config: Arc::new(RwLock::new(config)),
        config_path,
        engine,
        router,
        presets,
        agents,
        skills,
        skill_dispatcher,
        helpers,
        rag_http,
        quantize_jobs: Arc::new(QuantizeJobs::new()),
        started_at: chrono::Utc::now(),
        log_filter_reload,
    })
}
