//! Shared application state passed to all API handlers.
//!
//! No process-wide singletons: every component is constructed once at
//! startup (see `bootstrap`) and reached through this container. The
//! pieces that `POST /admin/config/reload` may swap (router, admin key,
//! memory threshold, presets, log level) sit behind locks; everything
//! else is immutable after startup.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use lmx_agents::AgentsRuntime;
use lmx_domain::config::Config;
use lmx_engine::presets::PresetManager;
use lmx_engine::router::TaskRouter;
use lmx_engine::InferenceEngine;
use lmx_helpers::HelperNodeRegistry;
use lmx_skills::dispatch::SkillDispatcher;
use lmx_skills::manifest::SkillRegistry;

use crate::quantize::QuantizeJobs;

#[derive(Clone)]
pub struct AppState {
    // ── Config ────────────────────────────────────────────────────────
    /// Live config; a reload swaps the whole value.
    pub config: Arc<RwLock<Config>>,
    pub config_path: Option<PathBuf>,

    // ── Core services ─────────────────────────────────────────────────
    pub engine: Arc<InferenceEngine>,
    pub router: Arc<RwLock<TaskRouter>>,
    pub presets: Arc<PresetManager>,

    // ── Agents & skills ───────────────────────────────────────────────
    pub agents: Arc<AgentsRuntime>,
    pub skills: Arc<SkillRegistry>,
    pub skill_dispatcher: Arc<dyn SkillDispatcher>,

    // ── Helpers & facades ─────────────────────────────────────────────
    pub helpers: Arc<HelperNodeRegistry>,
    pub rag_http: reqwest::Client,

    // ── Admin plane ───────────────────────────────────────────────────
    pub quantize_jobs: Arc<QuantizeJobs>,
    pub started_at: DateTime<Utc>,

    /// Applies a new log-level directive to the live subscriber.
    pub log_filter_reload: Option<Arc<dyn Fn(&str) + Send + Sync>>,

    // ── Security (startup-computed, admin key reloadable) ─────────────
    /// SHA-256 of the admin key. `None` disables the admin gate.
    pub admin_key_hash: Arc<RwLock<Option<Vec<u8>>>>,
    /// SHA-256 of the optional inference key for `/v1/*`.
    pub inference_key_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn uptime_sec(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
