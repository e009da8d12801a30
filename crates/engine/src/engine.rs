//! Inference engine — loaded-model registry, lifecycle, and the
//! generate / stream_generate paths.
//!
//! Lifecycle per load: memory check → candidate backends from the
//! compatibility registry → optional supervised probe → construct with
//! the merged performance profile → canary → (non-fatal) warmup → ready.
//! Models absent from disk go through the download-confirmation flow
//! instead.
//!
//! Ownership: each registry entry exclusively owns its backend handle;
//! the handle is closed only on unload, and unload waits until no
//! in-flight request still references the model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use lmx_domain::chat::{ChatMessage, Completion, Priority, SamplingParams, Usage};
use lmx_domain::config::Config;
use lmx_domain::events::ServerEvent;
use lmx_domain::stream::{ChunkStream, StreamChunk};
use lmx_domain::{Error, Result};

use crate::backend::{Backend, BackendFactory, BackendKind, PerformanceProfile, SpeculativeStatus};
use crate::compat::{CompatOutcome, CompatibilityRegistry};
use crate::concurrency::ConcurrencyController;
use crate::events::EventBus;
use crate::manager::{DownloadStatus, DownloadTask, ModelManager};
use crate::memory::MemoryMonitor;
use crate::metrics::{MetricsCollector, RequestRecord};
use crate::parser::{parse_tool_calls, StreamingToolParser};

/// Download confirmations expire after this long.
const CONFIRMATION_TTL: Duration = Duration::from_secs(600);

/// Characters-per-token heuristic used for context trimming and prompt
/// token estimates on streams.
const CHARS_PER_TOKEN: usize = 4;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loaded model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Loading,
    Warming,
    Ready,
    Quarantined,
}

pub struct LoadedModel {
    pub model_id: String,
    backend: Arc<dyn Backend>,
    pub backend_kind: BackendKind,
    pub backend_version: String,
    pub context_length: u32,
    pub estimated_memory_bytes: u64,
    pub profile: PerformanceProfile,
    pub speculative: SpeculativeStatus,
    pub loaded_at: DateTime<Utc>,
    pub keep_alive: Option<Duration>,
    last_used_at: Mutex<DateTime<Utc>>,
    request_count: AtomicU64,
    readiness: Mutex<Readiness>,
}

impl LoadedModel {
    fn touch(&self) {
        *self.last_used_at.lock() = Utc::now();
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.lock()
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        *self.last_used_at.lock()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: self.model_id.clone(),
            backend: self.backend_kind,
            backend_version: self.backend_version.clone(),
            state: self.readiness(),
            context_length: self.context_length,
            estimated_memory_bytes: self.estimated_memory_bytes,
            loaded_at: self.loaded_at,
            last_used_at: self.last_used_at(),
            request_count: self.request_count(),
            speculative: self.speculative.clone(),
            performance: self.profile.clone(),
        }
    }
}

/// Serializable view of a loaded model for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub backend: BackendKind,
    pub backend_version: String,
    pub state: Readiness,
    pub context_length: u32,
    pub estimated_memory_bytes: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub request_count: u64,
    pub speculative: SpeculativeStatus,
    pub performance: PerformanceProfile,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Load options & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Request-level performance overrides (highest precedence).
    pub performance: HashMap<String, serde_json::Value>,
    /// Preset-level performance overrides (middle precedence).
    pub preset_performance: HashMap<String, serde_json::Value>,
    /// Override the engine's `auto_download` setting for this call.
    pub auto_download: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded {
        #[serde(flatten)]
        info: Box<ModelInfo>,
    },
    /// Model absent on disk and auto-download is off: the caller must
    /// confirm with the one-shot token within the TTL.
    DownloadRequired {
        model_id: String,
        confirmation_token: String,
        estimated_size_bytes: u64,
    },
    /// Download started; an auto-load chains on completion.
    Downloading {
        model_id: String,
        download_id: String,
    },
}

struct PendingConfirmation {
    model_id: String,
    estimated_bytes: u64,
    created_at: Instant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub inference_timeout: Duration,
    pub loader_timeout: Duration,
    pub isolated_loader: bool,
    pub warmup_on_load: bool,
    pub auto_download: bool,
    /// Global idle-eviction window. Zero disables eviction.
    pub keep_alive: Duration,
    pub allow_unsupported_runtime: bool,
    pub backend_preference: Vec<BackendKind>,
    pub load_safety_margin_gb: f64,
    /// Engine-global performance profile (lowest precedence).
    pub global_performance: HashMap<String, serde_json::Value>,
    /// Per-model keep-alive overrides.
    pub keep_alive_overrides: HashMap<String, Duration>,
    /// Per-model performance overrides from config.
    pub model_performance: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        let backend_preference = config
            .models
            .backend_preference
            .iter()
            .filter_map(|name| BackendKind::parse(name))
            .collect();
        let keep_alive_overrides = config
            .models
            .overrides
            .iter()
            .filter_map(|(id, o)| {
                o.keep_alive_sec
                    .map(|sec| (id.clone(), Duration::from_secs(sec)))
            })
            .collect();
        let model_performance = config
            .models
            .overrides
            .iter()
            .filter(|(_, o)| !o.performance.is_empty())
            .map(|(id, o)| (id.clone(), o.performance.clone()))
            .collect();
        Self {
            inference_timeout: Duration::from_secs_f64(
                config.server.inference_timeout_sec.clamp(10.0, 3600.0),
            ),
            loader_timeout: Duration::from_secs_f64(config.models.loader_timeout_sec),
            isolated_loader: config.models.isolated_loader,
            warmup_on_load: config.models.warmup_on_load,
            auto_download: config.models.auto_download,
            keep_alive: Duration::from_secs(config.models.keep_alive_sec),
            allow_unsupported_runtime: config.models.allow_unsupported_runtime,
            backend_preference,
            load_safety_margin_gb: config.memory.load_safety_margin_gb,
            global_performance: HashMap::new(),
            keep_alive_overrides,
            model_performance,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InferenceEngine {
    options: EngineOptions,
    factory: Arc<dyn BackendFactory>,
    controller: Arc<ConcurrencyController>,
    monitor: Arc<MemoryMonitor>,
    metrics: Arc<MetricsCollector>,
    compat: Arc<CompatibilityRegistry>,
    manager: Arc<ModelManager>,
    events: Arc<EventBus>,

    registry: RwLock<HashMap<String, Arc<LoadedModel>>>,
    load_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    confirmations: Mutex<HashMap<String, PendingConfirmation>>,
}

impl InferenceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: EngineOptions,
        factory: Arc<dyn BackendFactory>,
        controller: Arc<ConcurrencyController>,
        monitor: Arc<MemoryMonitor>,
        metrics: Arc<MetricsCollector>,
        compat: Arc<CompatibilityRegistry>,
        manager: Arc<ModelManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            options,
            factory,
            controller,
            monitor,
            metrics,
            compat,
            manager,
            events,
            registry: RwLock::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
            confirmations: Mutex::new(HashMap::new()),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn compat(&self) -> &Arc<CompatibilityRegistry> {
        &self.compat
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.registry.read().contains_key(model_id)
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_info(&self, model_id: &str) -> Option<ModelInfo> {
        self.registry.read().get(model_id).map(|m| m.info())
    }

    pub fn list_infos(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> =
            self.registry.read().values().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        infos
    }

    pub fn model_load_snapshot(&self, model_ids: &[String]) -> HashMap<String, f64> {
        self.controller.model_load_snapshot(model_ids)
    }

    // ── Load ───────────────────────────────────────────────────────────

    // Boxed rather than `async fn` because the download-completion callback
    // below spawns a task that calls back into `load`, and the compiler
    // cannot resolve the `Send` auto-trait for a self-referential opaque
    // future type; boxing gives it a concrete type to bottom out on.
    pub fn load<'a>(
        self: &'a Arc<Self>,
        model_id: &'a str,
        opts: LoadOptions,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<LoadOutcome>> + Send + 'a>> {
        Box::pin(self.load_inner(model_id, opts))
    }

    async fn load_inner(self: &Arc<Self>, model_id: &str, opts: LoadOptions) -> Result<LoadOutcome> {
        let lock = self.load_lock_for(model_id);
        let _guard = lock.lock().await;

        // Idempotent: already loaded and ready.
        if let Some(existing) = self.registry.read().get(model_id) {
            if existing.readiness() == Readiness::Ready {
                return Ok(LoadOutcome::Loaded {
                    info: Box::new(existing.info()),
                });
            }
        }

        // Absent from disk → download flow.
        if !self.manager.is_available(model_id) {
            return self.start_download_flow(model_id, &opts).await;
        }

        let profile = self.effective_profile(model_id, &opts)?;

        // Memory headroom check.
        let snapshot = self.monitor.refresh();
        let needed_gb =
            profile.memory_estimate_gb.unwrap_or(0.0) + self.options.load_safety_margin_gb;
        if snapshot.over_threshold() && snapshot.available_gb() < needed_gb {
            return Err(Error::InsufficientMemory(format!(
                "need {:.1} GB but only {:.1} GB available with memory at {:.0}%",
                needed_gb,
                snapshot.available_gb(),
                snapshot.used_pct
            )));
        }

        // Candidate backends from the compatibility registry.
        let mut candidates = self
            .compat
            .candidate_backends(model_id, &self.options.backend_preference);
        if candidates.is_empty() {
            if self.options.allow_unsupported_runtime {
                candidates = self.options.backend_preference.clone();
            } else {
                return Err(Error::ModelRuntimeIncompatible(format!(
                    "all backends are quarantined for {model_id}"
                )));
            }
        }

        let mut last_error: Option<Error> = None;
        for kind in candidates {
            match self.try_load_backend(model_id, kind, &profile).await {
                Ok(model) => {
                    let info = model.info();
                    self.registry
                        .write()
                        .insert(model_id.to_string(), model.clone());
                    self.compat.record(
                        model_id,
                        kind,
                        &info.backend_version,
                        CompatOutcome::Pass,
                        "loaded",
                    )?;
                    self.events.publish(ServerEvent::ModelLoaded {
                        model_id: model_id.to_string(),
                        backend: kind.as_str().to_string(),
                        backend_version: info.backend_version.clone(),
                    });
                    tracing::info!(
                        model_id,
                        backend = kind.as_str(),
                        "model loaded"
                    );
                    return Ok(LoadOutcome::Loaded {
                        info: Box::new(info),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        model_id,
                        backend = kind.as_str(),
                        error = %e,
                        "backend candidate failed"
                    );
                    // require_supported rejections abort instead of
                    // silently falling through to a weaker backend.
                    if matches!(&e, Error::ModelRuntimeIncompatible(msg) if msg.contains("speculative"))
                    {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::ModelLoaderCrashed(format!("no backend could load {model_id}"))
        }))
    }

    async fn try_load_backend(
        &self,
        model_id: &str,
        kind: BackendKind,
        profile: &PerformanceProfile,
    ) -> Result<Arc<LoadedModel>> {
        // Supervised bring-up probe, bounded by the loader timeout.
        if self.options.isolated_loader {
            let probe = tokio::time::timeout(
                self.options.loader_timeout,
                self.factory.probe(model_id, kind),
            )
            .await;
            match probe {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.compat
                        .record(model_id, kind, "unknown", CompatOutcome::Fail, &e.to_string())?;
                    return Err(e);
                }
                Err(_) => {
                    let message =
                        format!("loader probe timed out after {:?}", self.options.loader_timeout);
                    self.compat
                        .record(model_id, kind, "unknown", CompatOutcome::Fail, &message)?;
                    return Err(Error::ModelLoaderCrashed(message));
                }
            }
        }

        let backend = self.factory.create(model_id, kind, profile).await?;
        let version = backend.version().to_string();

        // Speculative: degrade silently unless the profile insists.
        let speculative = match &profile.speculative {
            Some(spec) => {
                if backend.speculative_supported() {
                    SpeculativeStatus {
                        requested: true,
                        active: true,
                        reason: None,
                        draft_model: spec.draft_model.clone(),
                        num_tokens: spec.num_tokens,
                    }
                } else if spec.require_supported {
                    backend.close().await;
                    let message = format!("backend {kind} does not support speculative decoding");
                    self.compat
                        .record(model_id, kind, &version, CompatOutcome::Fail, &message)?;
                    return Err(Error::ModelRuntimeIncompatible(message));
                } else {
                    SpeculativeStatus {
                        requested: true,
                        active: false,
                        reason: Some("unsupported_by_backend".to_string()),
                        draft_model: spec.draft_model.clone(),
                        num_tokens: spec.num_tokens,
                    }
                }
            }
            None => SpeculativeStatus::default(),
        };

        // Canary: a tiny chat to catch load-time faults.
        let canary_params = SamplingParams {
            max_tokens: Some(8),
            ..Default::default()
        };
        if let Err(e) = backend
            .generate(&[ChatMessage::user("ping")], &canary_params)
            .await
        {
            backend.close().await;
            let message = format!("canary failed: {e}");
            self.compat
                .record(model_id, kind, &version, CompatOutcome::Fail, &message)?;
            return Err(Error::ModelLoaderCrashed(message));
        }

        // Warmup is best-effort.
        if self.options.warmup_on_load {
            if let Err(e) = backend
                .generate(&[ChatMessage::user("Warmup.")], &canary_params)
                .await
            {
                tracing::warn!(model_id, error = %e, "warmup failed (non-fatal)");
            }
        }

        let now = Utc::now();
        Ok(Arc::new(LoadedModel {
            model_id: model_id.to_string(),
            context_length: backend.context_length(),
            estimated_memory_bytes: backend.estimated_memory_bytes(),
            backend_kind: kind,
            backend_version: version,
            backend,
            profile: profile.clone(),
            speculative,
            loaded_at: now,
            keep_alive: self.options.keep_alive_overrides.get(model_id).copied(),
            last_used_at: Mutex::new(now),
            request_count: AtomicU64::new(0),
            readiness: Mutex::new(Readiness::Ready),
        }))
    }

    /// Merge engine globals ← config per-model ← preset ← request.
    fn effective_profile(&self, model_id: &str, opts: &LoadOptions) -> Result<PerformanceProfile> {
        let mut profile = PerformanceProfile::from_map(&self.options.global_performance)?;
        if let Some(model_map) = self.options.model_performance.get(model_id) {
            profile = profile.merged_with(&PerformanceProfile::from_map(model_map)?);
        }
        if !opts.preset_performance.is_empty() {
            profile = profile.merged_with(&PerformanceProfile::from_map(&opts.preset_performance)?);
        }
        if !opts.performance.is_empty() {
            profile = profile.merged_with(&PerformanceProfile::from_map(&opts.performance)?);
        }
        Ok(profile)
    }

    fn load_lock_for(&self, model_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .lock()
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── Download flow ──────────────────────────────────────────────────

    async fn start_download_flow(
        self: &Arc<Self>,
        model_id: &str,
        opts: &LoadOptions,
    ) -> Result<LoadOutcome> {
        let auto_download = opts.auto_download.unwrap_or(self.options.auto_download);
        if !auto_download {
            let estimated = self.manager.estimate_size(model_id, None).await;
            let token = Uuid::new_v4().simple().to_string();
            self.confirmations.lock().insert(
                token.clone(),
                PendingConfirmation {
                    model_id: model_id.to_string(),
                    estimated_bytes: estimated,
                    created_at: Instant::now(),
                },
            );
            return Ok(LoadOutcome::DownloadRequired {
                model_id: model_id.to_string(),
                confirmation_token: token,
                estimated_size_bytes: estimated,
            });
        }

        let task = self.begin_download_with_autoload(model_id).await?;
        Ok(LoadOutcome::Downloading {
            model_id: model_id.to_string(),
            download_id: task.download_id,
        })
    }

    /// Consume a confirmation token (one-shot, TTL-bounded) and start the
    /// download it referred to.
    pub async fn confirm_download(self: &Arc<Self>, token: &str) -> Result<DownloadTask> {
        let pending = self
            .confirmations
            .lock()
            .remove(token)
            .ok_or_else(|| Error::Validation("unknown or already-used confirmation token".into()))?;
        if pending.created_at.elapsed() > CONFIRMATION_TTL {
            return Err(Error::Validation("confirmation token expired".into()));
        }
        self.begin_download_with_autoload(&pending.model_id).await
    }

    async fn begin_download_with_autoload(self: &Arc<Self>, model_id: &str) -> Result<DownloadTask> {
        let engine = Arc::downgrade(self);
        let model = model_id.to_string();
        let events = self.events.clone();
        let repo = model.clone();

        let task = self
            .manager
            .start_download(
                model_id,
                None,
                Vec::new(),
                Vec::new(),
                Some(Box::new(move |status| {
                    if status != DownloadStatus::Completed {
                        return;
                    }
                    let Some(engine) = engine.upgrade() else {
                        return;
                    };
                    // Auto-load is attempted once; on failure we log and
                    // abandon (the download itself stays completed).
                    let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                        Box::pin(async move {
                            if let Err(e) = engine.load(&model, LoadOptions::default()).await {
                                tracing::warn!(model_id = %model, error = %e, "auto-load after download failed");
                            }
                        });
                    tokio::spawn(fut);
                })),
            )
            .await?;

        events.publish(ServerEvent::DownloadStarted {
            download_id: task.download_id.clone(),
            repo_id: repo,
        });
        Ok(task)
    }

    /// Count of pending (unexpired) download confirmations.
    pub fn pending_confirmation_count(&self) -> usize {
        let mut confirmations = self.confirmations.lock();
        confirmations.retain(|_, p| p.created_at.elapsed() <= CONFIRMATION_TTL);
        confirmations.len()
    }

    // ── Unload / eviction / quarantine ─────────────────────────────────

    pub async fn unload(&self, model_id: &str) -> Result<()> {
        let model = self
            .registry
            .write()
            .remove(model_id)
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;

        // No mid-request eviction: wait for in-flight references to drain.
        while self.controller.active_count_for(model_id) > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        model.backend.close().await;
        self.events.publish(ServerEvent::ModelUnloaded {
            model_id: model_id.to_string(),
        });
        tracing::info!(model_id, "model unloaded");
        Ok(())
    }

    /// Delete a model from the disk cache. Refused while loaded.
    pub fn delete_model(&self, model_id: &str) -> Result<()> {
        if self.is_loaded(model_id) {
            return Err(Error::ModelInUse(model_id.to_string()));
        }
        self.manager.delete(model_id)
    }

    /// Mark a (model, backend) pair unusable for this load cycle.
    pub fn quarantine(&self, model_id: &str, reason: &str) -> Result<()> {
        let registry = self.registry.read();
        let model = registry
            .get(model_id)
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;
        *model.readiness.lock() = Readiness::Quarantined;
        self.compat.record(
            model_id,
            model.backend_kind,
            &model.backend_version,
            CompatOutcome::Quarantine,
            reason,
        )?;
        self.events.publish(ServerEvent::ModelQuarantined {
            model_id: model_id.to_string(),
            backend: model.backend_kind.as_str().to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Background idle-eviction sweep.
    pub fn spawn_idle_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let now = Utc::now();
                let idle: Vec<String> = engine
                    .registry
                    .read()
                    .values()
                    .filter_map(|model| {
                        let keep_alive = model.keep_alive.unwrap_or(engine.options.keep_alive);
                        if keep_alive.is_zero() {
                            return None;
                        }
                        let idle_for = (now - model.last_used_at())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        (idle_for > keep_alive).then(|| model.model_id.clone())
                    })
                    .collect();
                for model_id in idle {
                    tracing::info!(model_id = %model_id, "idle eviction");
                    if let Err(e) = engine.unload(&model_id).await {
                        tracing::warn!(model_id = %model_id, error = %e, "idle eviction failed");
                    }
                }
            }
        })
    }

    /// Voluntary drain: wait for in-flight work, do not abort it.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.controller.drain(timeout).await
    }

    // ── Inference ──────────────────────────────────────────────────────

    fn require_ready(&self, model_id: &str) -> Result<Arc<LoadedModel>> {
        let registry = self.registry.read();
        let model = registry
            .get(model_id)
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;
        match model.readiness() {
            Readiness::Ready => Ok(model.clone()),
            Readiness::Quarantined => Err(Error::ModelRuntimeIncompatible(format!(
                "{model_id} is quarantined"
            ))),
            _ => Err(Error::ModelNotFound(model_id.to_string())),
        }
    }

    pub async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
        priority: Priority,
        client_id: Option<&str>,
    ) -> Result<Completion> {
        params.validate()?;
        let model = self.require_ready(model_id)?;
        let slots = self
            .controller
            .acquire(model_id, priority, client_id)
            .await?;
        let messages = trim_messages(messages, params.num_ctx, model.context_length);

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.options.inference_timeout,
            model.backend.generate(&messages, params),
        )
        .await;
        let latency = started.elapsed();

        let completion = match outcome {
            Err(_) => {
                self.record_request(model_id, latency, slots.queue_wait(), Usage::default(), true);
                return Err(Error::RequestTimeout(
                    self.options.inference_timeout.as_secs_f64(),
                ));
            }
            Ok(Err(e)) => {
                self.record_request(model_id, latency, slots.queue_wait(), Usage::default(), true);
                return Err(e);
            }
            Ok(Ok(completion)) => completion,
        };

        model.touch();
        self.controller.record_latency(latency);
        self.record_request(
            model_id,
            latency,
            slots.queue_wait(),
            completion.usage,
            false,
        );

        let parsed = parse_tool_calls(&completion.text, params.tools.as_deref());
        let finish_reason = if parsed.has_tool_calls() {
            "tool_calls"
        } else {
            "stop"
        };
        Ok(Completion {
            model: model_id.to_string(),
            content: parsed.content,
            tool_calls: parsed.tool_calls,
            usage: completion.usage,
            finish_reason: finish_reason.to_string(),
        })
    }

    pub async fn stream_generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
        priority: Priority,
        client_id: Option<&str>,
    ) -> Result<ChunkStream> {
        params.validate()?;
        let model = self.require_ready(model_id)?;
        let slots = self
            .controller
            .acquire(model_id, priority, client_id)
            .await?;
        let messages = trim_messages(messages, params.num_ctx, model.context_length);
        let prompt_tokens = (messages
            .iter()
            .map(|m| m.content.chars().count())
            .sum::<usize>()
            / CHARS_PER_TOKEN) as u32;

        let queue_wait = slots.queue_wait();
        let backend_stream = match model.backend.stream(&messages, params).await {
            Ok(stream) => stream,
            Err(e) => {
                self.record_request(model_id, Duration::ZERO, queue_wait, Usage::default(), true);
                return Err(e);
            }
        };

        let mut parser = StreamingToolParser::new(params.tools.clone());
        let controller = self.controller.clone();
        let metrics = self.metrics.clone();
        let model_name = model_id.to_string();
        let speculative_requested = model.speculative.requested;
        let model = model.clone();

        let stream = async_stream::stream! {
            // Slots ride inside the stream: dropping the stream (client
            // disconnect) releases them and stops generation.
            let _slots = slots;
            let started = Instant::now();
            let mut backend_stream = backend_stream;
            let mut completion_tokens: u32 = 0;
            let mut accepted: u64 = 0;
            let mut rejected: u64 = 0;
            let mut ignored: u64 = 0;
            let mut telemetry_seen = false;

            while let Some(item) = backend_stream.next().await {
                match item {
                    Ok(token) => {
                        completion_tokens += 1;
                        match token.from_draft {
                            Some(true) => {
                                accepted += 1;
                                telemetry_seen = true;
                            }
                            Some(false) => {
                                rejected += 1;
                                telemetry_seen = true;
                            }
                            None => ignored += 1,
                        }
                        let result = parser.feed(&token.text);
                        if let Some(content) = result.content_delta {
                            yield Ok(StreamChunk::Token(content));
                        }
                        for delta in result.tool_call_deltas {
                            yield Ok(StreamChunk::ToolCall(delta));
                        }
                    }
                    Err(e) => {
                        metrics.record_request(RequestRecord {
                            model_id: model_name.clone(),
                            latency_sec: started.elapsed().as_secs_f64(),
                            queue_wait_sec: queue_wait.as_secs_f64(),
                            prompt_tokens,
                            completion_tokens,
                            error: true,
                        });
                        yield Err(e);
                        return;
                    }
                }
            }

            let result = parser.flush();
            if let Some(content) = result.content_delta {
                yield Ok(StreamChunk::Token(content));
            }
            for delta in result.tool_call_deltas {
                yield Ok(StreamChunk::ToolCall(delta));
            }

            model.touch();
            let latency = started.elapsed();
            controller.record_latency(latency);
            metrics.record_request(RequestRecord {
                model_id: model_name.clone(),
                latency_sec: latency.as_secs_f64(),
                queue_wait_sec: queue_wait.as_secs_f64(),
                prompt_tokens,
                completion_tokens,
                error: false,
            });
            if speculative_requested {
                metrics.record_speculative(
                    &model_name,
                    accepted,
                    rejected,
                    ignored,
                    telemetry_seen,
                );
            }

            yield Ok(StreamChunk::End {
                usage: Usage::new(prompt_tokens, completion_tokens),
            });
        };
        Ok(Box::pin(stream))
    }

    fn record_request(
        &self,
        model_id: &str,
        latency: Duration,
        queue_wait: Duration,
        usage: Usage,
        error: bool,
    ) {
        self.metrics.record_request(RequestRecord {
            model_id: model_id.to_string(),
            latency_sec: latency.as_secs_f64(),
            queue_wait_sec: queue_wait.as_secs_f64(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            error,
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context trimming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trim the transcript to the `num_ctx` token budget (clamped to the
/// model context length), using the 4-chars/token heuristic. Walks from
/// the newest message backwards and may cut inside a message.
fn trim_messages(
    messages: &[ChatMessage],
    num_ctx: Option<u32>,
    context_length: u32,
) -> Vec<ChatMessage> {
    let Some(num_ctx) = num_ctx else {
        return messages.to_vec();
    };
    let budget_tokens = num_ctx.min(context_length).max(1) as usize;
    let char_budget = budget_tokens * CHARS_PER_TOKEN;

    let mut kept: Vec<ChatMessage> = Vec::new();
    let mut used = 0usize;
    for message in messages.iter().rev() {
        let len = message.content.chars().count();
        if used + len <= char_budget {
            kept.push(message.clone());
            used += len;
        } else {
            let remaining = char_budget - used;
            if remaining > 0 {
                let chars: Vec<char> = message.content.chars().collect();
                let tail: String = chars[chars.len() - remaining..].iter().collect();
                kept.push(ChatMessage::new(message.role.clone(), tail));
            }
            break;
        }
    }
    kept.reverse();
    kept
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::{BackendCompletion, BackendToken, BackendTokenStream};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Scripted backend for engine tests: returns a fixed text, optionally
    /// failing, optionally blocking until released.
    #[derive(Debug)]
    pub struct ScriptedBackend {
        pub kind: BackendKind,
        pub text: String,
        pub fail_generate: AtomicBool,
        pub release: Option<Arc<tokio::sync::Notify>>,
        pub usage: Usage,
    }

    impl Default for ScriptedBackend {
        fn default() -> Self {
            Self {
                kind: BackendKind::Mlx,
                text: "pong".into(),
                fail_generate: AtomicBool::new(false),
                release: None,
                usage: Usage::new(8, 5),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _params: &SamplingParams,
        ) -> Result<BackendCompletion> {
            if self.fail_generate.load(Ordering::Relaxed) {
                return Err(Error::Internal("scripted failure".into()));
            }
            if let Some(release) = &self.release {
                release.notified().await;
            }
            Ok(BackendCompletion {
                text: self.text.clone(),
                usage: self.usage,
            })
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _params: &SamplingParams,
        ) -> Result<BackendTokenStream> {
            let text = self.text.clone();
            let stream = async_stream::stream! {
                for chunk in text.split_inclusive(' ') {
                    yield Ok(BackendToken::plain(chunk));
                }
            };
            Ok(Box::pin(stream))
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn version(&self) -> &str {
            "test/1.0"
        }

        fn context_length(&self) -> u32 {
            4096
        }

        async fn close(&self) {}
    }

    /// Factory returning scripted backends; `fail_kinds` simulates
    /// per-backend load failures for fallback tests.
    pub struct ScriptedFactory {
        pub text: String,
        pub fail_kinds: Vec<BackendKind>,
        pub probe_fail: bool,
    }

    impl Default for ScriptedFactory {
        fn default() -> Self {
            Self {
                text: "pong".into(),
                fail_kinds: Vec::new(),
                probe_fail: false,
            }
        }
    }

    #[async_trait]
    impl BackendFactory for ScriptedFactory {
        async fn probe(&self, _model_id: &str, kind: BackendKind) -> Result<()> {
            if self.probe_fail || self.fail_kinds.contains(&kind) {
                return Err(Error::ModelLoaderCrashed(format!("probe {kind} failed")));
            }
            Ok(())
        }

        async fn create(
            &self,
            _model_id: &str,
            kind: BackendKind,
            _profile: &PerformanceProfile,
        ) -> Result<Arc<dyn Backend>> {
            if self.fail_kinds.contains(&kind) {
                return Err(Error::ModelLoaderCrashed(format!("create {kind} failed")));
            }
            Ok(Arc::new(ScriptedBackend {
                kind,
                text: self.text.clone(),
                ..Default::default()
            }))
        }
    }

    pub fn engine_with_factory(
        factory: ScriptedFactory,
        models_dir: &std::path::Path,
    ) -> Arc<InferenceEngine> {
        let options = EngineOptions {
            inference_timeout: Duration::from_secs(10),
            loader_timeout: Duration::from_secs(5),
            isolated_loader: true,
            warmup_on_load: true,
            auto_download: false,
            keep_alive: Duration::ZERO,
            allow_unsupported_runtime: false,
            backend_preference: vec![BackendKind::Mlx, BackendKind::Gguf],
            load_safety_margin_gb: 0.0,
            global_performance: HashMap::new(),
            keep_alive_overrides: HashMap::new(),
            model_performance: HashMap::new(),
        };
        let controller = Arc::new(ConcurrencyController::new(
            crate::concurrency::ControllerOptions {
                semaphore_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        Arc::new(InferenceEngine::new(
            options,
            Arc::new(factory),
            controller,
            Arc::new(MemoryMonitor::new(100.0, Duration::from_secs(60))),
            Arc::new(MetricsCollector::new()),
            Arc::new(CompatibilityRegistry::new(None)),
            Arc::new(
                ModelManager::new(
                    models_dir.to_path_buf(),
                    "http://127.0.0.1:9".into(),
                    None,
                )
                .unwrap(),
            ),
            Arc::new(EventBus::new(64)),
        ))
    }

    /// Put a fake model on disk so `is_available` passes.
    pub fn seed_model(models_dir: &std::path::Path, model_id: &str) {
        let dir = models_dir.join(model_id.replace('/', "--"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("weights.bin"), b"w").unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn trim_keeps_everything_without_budget() {
        let messages = vec![ChatMessage::user("hello world")];
        assert_eq!(trim_messages(&messages, None, 4096), messages);
    }

    #[test]
    fn trim_drops_oldest_first() {
        let messages = vec![
            ChatMessage::system("a".repeat(100)),
            ChatMessage::user("b".repeat(40)),
        ];
        // Budget of 10 tokens = 40 chars: exactly the last message.
        let trimmed = trim_messages(&messages, Some(10), 4096);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].role, "user");
    }

    #[test]
    fn trim_cuts_inside_last_message() {
        let messages = vec![ChatMessage::user("abcdefgh")];
        // 1 token = 4 chars: keeps the message tail.
        let trimmed = trim_messages(&messages, Some(1), 4096);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].content, "efgh");
    }

    #[test]
    fn trim_clamps_to_context_length() {
        let messages = vec![ChatMessage::user("x".repeat(100))];
        let trimmed = trim_messages(&messages, Some(1000), 2);
        assert_eq!(trimmed[0].content.chars().count(), 8);
    }

    #[tokio::test]
    async fn load_generate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());

        let outcome = engine.load("m", LoadOptions::default()).await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { .. }));
        assert!(engine.is_loaded("m"));

        let completion = engine
            .generate(
                "m",
                &[ChatMessage::user("hi")],
                &SamplingParams::default(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();
        assert_eq!(completion.content.as_deref(), Some("pong"));
        assert_eq!(completion.usage.total_tokens, 13);
        assert_eq!(completion.finish_reason, "stop");
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        engine.load("m", LoadOptions::default()).await.unwrap();
        let again = engine.load("m", LoadOptions::default()).await.unwrap();
        assert!(matches!(again, LoadOutcome::Loaded { .. }));
        assert_eq!(engine.loaded_ids(), vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn generate_unknown_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        let err = engine
            .generate(
                "ghost",
                &[ChatMessage::user("hi")],
                &SamplingParams::default(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_gguf() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(
            ScriptedFactory {
                fail_kinds: vec![BackendKind::Mlx],
                ..Default::default()
            },
            dir.path(),
        );
        let outcome = engine.load("m", LoadOptions::default()).await.unwrap();
        let LoadOutcome::Loaded { info } = outcome else {
            panic!("expected load");
        };
        assert_eq!(info.backend, BackendKind::Gguf);
        // The failure was recorded against the primary backend.
        assert_eq!(
            engine.compat().latest_outcome("m", BackendKind::Mlx),
            Some(CompatOutcome::Fail)
        );
        assert_eq!(
            engine.compat().latest_outcome("m", BackendKind::Gguf),
            Some(CompatOutcome::Pass)
        );
    }

    #[tokio::test]
    async fn absent_model_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        let outcome = engine.load("absent", LoadOptions::default()).await.unwrap();
        let LoadOutcome::DownloadRequired {
            confirmation_token, ..
        } = outcome
        else {
            panic!("expected download_required");
        };
        assert_eq!(engine.pending_confirmation_count(), 1);

        // Consuming the token is one-shot (download fails against the
        // unreachable hub, but the token is spent either way).
        let _ = engine.confirm_download(&confirmation_token).await;
        let err = engine.confirm_download(&confirmation_token).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unload_then_reload_same_backend() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());

        let first = engine.load("m", LoadOptions::default()).await.unwrap();
        let LoadOutcome::Loaded { info: first } = first else {
            panic!()
        };
        engine.unload("m").await.unwrap();
        assert!(!engine.is_loaded("m"));

        let second = engine.load("m", LoadOptions::default()).await.unwrap();
        let LoadOutcome::Loaded { info: second } = second else {
            panic!()
        };
        assert_eq!(first.backend, second.backend);
        assert_eq!(first.backend_version, second.backend_version);
        assert_eq!(second.state, Readiness::Ready);
    }

    #[tokio::test]
    async fn unload_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        assert!(matches!(
            engine.unload("ghost").await,
            Err(Error::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_refused_while_loaded() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        engine.load("m", LoadOptions::default()).await.unwrap();
        assert!(matches!(
            engine.delete_model("m"),
            Err(Error::ModelInUse(_))
        ));
        engine.unload("m").await.unwrap();
        engine.delete_model("m").unwrap();
    }

    #[tokio::test]
    async fn quarantined_model_refuses_requests() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        engine.load("m", LoadOptions::default()).await.unwrap();
        engine.quarantine("m", "metal fault").unwrap();

        let err = engine
            .generate(
                "m",
                &[ChatMessage::user("hi")],
                &SamplingParams::default(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelRuntimeIncompatible(_)));
        assert!(engine.compat().is_quarantined("m", BackendKind::Mlx));
    }

    #[tokio::test]
    async fn stream_generate_parses_tool_calls_and_ends_with_usage() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let text = "Sure.<minimax:tool_call><invoke name=\"get_weather\">\
                    <parameter name=\"city\">SF</parameter></invoke></minimax:tool_call>";
        let engine = engine_with_factory(
            ScriptedFactory {
                text: text.into(),
                ..Default::default()
            },
            dir.path(),
        );
        engine.load("m", LoadOptions::default()).await.unwrap();

        let params = SamplingParams {
            tools: Some(vec![serde_json::json!({
                "type": "function",
                "function": {"name": "get_weather", "parameters": {"properties": {"city": {"type": "string"}}}}
            })]),
            ..Default::default()
        };
        let mut stream = engine
            .stream_generate("m", &[ChatMessage::user("hi")], &params, Priority::Normal, None)
            .await
            .unwrap();

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut end_usage = None;
        while let Some(chunk) = stream.next().await {
            match chunk.unwrap() {
                StreamChunk::Token(text) => content.push_str(&text),
                StreamChunk::ToolCall(delta) => tool_calls.push(delta),
                StreamChunk::End { usage } => end_usage = Some(usage),
            }
        }
        assert_eq!(content, "Sure.");
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name, "get_weather");
        assert_eq!(tool_calls[0].arguments, r#"{"city":"SF"}"#);
        let usage = end_usage.expect("end marker");
        assert!(usage.completion_tokens > 0);
        // In-flight slots were released when the stream finished.
        assert_eq!(engine.controller().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn dropping_stream_releases_slots() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        engine.load("m", LoadOptions::default()).await.unwrap();

        let stream = engine
            .stream_generate(
                "m",
                &[ChatMessage::user("hi")],
                &SamplingParams::default(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();
        assert_eq!(engine.controller().in_flight_count(), 1);
        drop(stream);
        assert_eq!(engine.controller().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn generate_records_metrics() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), "m");
        let engine = engine_with_factory(ScriptedFactory::default(), dir.path());
        engine.load("m", LoadOptions::default()).await.unwrap();
        engine
            .generate(
                "m",
                &[ChatMessage::user("hi")],
                &SamplingParams::default(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();
        let json = engine.metrics().json_view();
        assert_eq!(json["models"]["m"]["requests_total"], 1);
    }
}
