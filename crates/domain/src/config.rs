//! Opta-LMX configuration — YAML, loaded once at startup.
//!
//! Every option has a serde default so a minimal (or empty) config file
//! yields a runnable server. `Config::validate` returns severity-tagged
//! issues; the binary refuses to start on any `Error`-severity issue.
//!
//! A subset of options is hot-reloadable through `POST /admin/config/reload`:
//! routing, memory threshold, admin key, logging level, and presets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub helper_nodes: Vec<HelperNodeConfig>,
    #[serde(default)]
    pub presets: PresetsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub journaling: JournalingConfig,
}

impl Config {
    /// Load and parse a YAML config file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| crate::Error::Validation(format!("config parse: {e}")))
    }

    /// Validate cross-field constraints. Warnings are logged; errors abort
    /// startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if !(1..=64).contains(&self.server.max_concurrent_requests) {
            issues.push(ConfigIssue::error(format!(
                "server.max_concurrent_requests must be in 1..=64 (got {})",
                self.server.max_concurrent_requests
            )));
        }
        if !(10.0..=3600.0).contains(&self.server.inference_timeout_sec) {
            issues.push(ConfigIssue::error(format!(
                "server.inference_timeout_sec must be in 10..=3600 (got {})",
                self.server.inference_timeout_sec
            )));
        }
        if self.server.semaphore_timeout_sec <= 0.0 {
            issues.push(ConfigIssue::error(
                "server.semaphore_timeout_sec must be > 0".into(),
            ));
        }
        if self.server.adaptive_min_concurrent_requests < 1 {
            issues.push(ConfigIssue::error(
                "server.adaptive_min_concurrent_requests must be >= 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.memory.threshold_pct) {
            issues.push(ConfigIssue::error(format!(
                "memory.threshold_pct must be in 0..=100 (got {})",
                self.memory.threshold_pct
            )));
        }
        for (alias, targets) in &self.routing.aliases {
            if targets.is_empty() {
                issues.push(ConfigIssue::warning(format!(
                    "routing.aliases.{alias} has an empty preference list"
                )));
            }
            if alias == "auto" {
                issues.push(ConfigIssue::warning(
                    "routing.aliases.auto shadows the built-in auto alias".into(),
                ));
            }
        }
        if self.security.admin_key.is_none() && std::env::var("LMX_ADMIN_KEY").is_err() {
            issues.push(ConfigIssue::warning(
                "no admin key configured — /admin endpoints are unauthenticated".into(),
            ));
        }
        if self.security.mtls.mode == MtlsMode::Required
            && self.security.mtls.client_subject_header.is_empty()
        {
            issues.push(ConfigIssue::error(
                "security.mtls.client_subject_header is required when mode=required".into(),
            ));
        }
        for node in &self.helper_nodes {
            if node.base_url.is_empty() {
                issues.push(ConfigIssue::error(format!(
                    "helper_nodes.{}: base_url is required",
                    node.id
                )));
            }
        }
        if self.agents.scheduler.backend == QueueBackend::Sqlite
            && self.agents.scheduler.persist_path.is_none()
        {
            issues.push(ConfigIssue::error(
                "agents.scheduler.persist_path is required for the sqlite backend".into(),
            ));
        }
        if self.skills.dispatcher.backend == QueueBackend::Sqlite
            && self.skills.dispatcher.persist_path.is_none()
        {
            issues.push(ConfigIssue::error(
                "skills.dispatcher.persist_path is required for the sqlite backend".into(),
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: String) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message,
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Global cap on simultaneous inference requests (adaptive ceiling).
    #[serde(default = "d_4")]
    pub max_concurrent_requests: usize,
    /// Lane admission timeout before a request fails with `overloaded`.
    #[serde(default = "d_30f")]
    pub semaphore_timeout_sec: f64,
    /// Per-inference-call hard timeout.
    #[serde(default = "d_300f")]
    pub inference_timeout_sec: f64,
    /// Heartbeat cadence on `/admin/events` when idle.
    #[serde(default = "d_30")]
    pub sse_heartbeat_interval_sec: u64,
    #[serde(default = "d_true")]
    pub adaptive_concurrency_enabled: bool,
    #[serde(default = "d_2500f")]
    pub adaptive_latency_target_ms: f64,
    #[serde(default = "d_128")]
    pub adaptive_latency_window: usize,
    #[serde(default = "d_1")]
    pub adaptive_min_concurrent_requests: usize,
    /// Per-client fairness. `None` disables per-client lanes entirely.
    #[serde(default)]
    pub per_client_default_concurrency: Option<usize>,
    #[serde(default)]
    pub per_client_concurrency_overrides: HashMap<String, usize>,
    /// Per-IP token bucket on `/v1/chat/completions`. `None` disables it.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            max_concurrent_requests: 4,
            semaphore_timeout_sec: 30.0,
            inference_timeout_sec: 300.0,
            sse_heartbeat_interval_sec: 30,
            adaptive_concurrency_enabled: true,
            adaptive_latency_target_ms: 2500.0,
            adaptive_latency_window: 128,
            adaptive_min_concurrent_requests: 1,
            per_client_default_concurrency: None,
            per_client_concurrency_overrides: HashMap::new(),
            rate_limit: None,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_10")]
    pub requests_per_second: u64,
    #[serde(default = "d_20u32")]
    pub burst_size: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Models & backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// On-disk model cache root.
    #[serde(default = "d_models_dir")]
    pub models_directory: PathBuf,
    /// Download without a confirmation round-trip.
    #[serde(default)]
    pub auto_download: bool,
    /// Run a minimal inference after load (non-fatal on failure).
    #[serde(default = "d_true")]
    pub warmup_on_load: bool,
    /// Idle eviction: unload after this many seconds unused. 0 disables.
    #[serde(default = "d_0")]
    pub keep_alive_sec: u64,
    /// Bring the model up in a supervised child first, to contain crashes.
    #[serde(default = "d_true")]
    pub isolated_loader: bool,
    #[serde(default = "d_120f")]
    pub loader_timeout_sec: f64,
    /// Load models whose runtime signature is known-incompatible anyway.
    #[serde(default)]
    pub allow_unsupported_runtime: bool,
    /// Backend candidate order when the compatibility registry is silent.
    #[serde(default = "d_backend_preference")]
    pub backend_preference: Vec<String>,
    /// Runtime endpoints, keyed by backend kind name (`mlx`, `gguf`).
    #[serde(default)]
    pub backends: HashMap<String, BackendEndpointConfig>,
    /// Per-model overrides (keep-alive, concurrency cap, perf profile).
    #[serde(default)]
    pub overrides: HashMap<String, ModelOverrides>,
    /// Per-model concurrency caps (absent or >= global means uncapped).
    #[serde(default)]
    pub per_model_concurrency: HashMap<String, usize>,
    /// Shell command for quantization jobs; receives the model and target
    /// format via `LMX_QUANTIZE_*` env vars. `None` disables quantize.
    #[serde(default)]
    pub quantize_command: Option<String>,
    /// HuggingFace-compatible hub for downloads.
    #[serde(default = "d_hub_url")]
    pub hub_base_url: String,
    /// Env var holding the hub token, forwarded to download requests.
    #[serde(default = "d_hub_token_env")]
    pub hub_token_env: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_directory: d_models_dir(),
            auto_download: false,
            warmup_on_load: true,
            keep_alive_sec: 0,
            isolated_loader: true,
            loader_timeout_sec: 120.0,
            allow_unsupported_runtime: false,
            backend_preference: d_backend_preference(),
            backends: HashMap::new(),
            overrides: HashMap::new(),
            per_model_concurrency: HashMap::new(),
            quantize_command: None,
            hub_base_url: d_hub_url(),
            hub_token_env: d_hub_token_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelOverrides {
    #[serde(default)]
    pub keep_alive_sec: Option<u64>,
    /// Raw performance-profile keys merged under engine globals.
    #[serde(default)]
    pub performance: HashMap<String, serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// High watermark; loads are refused and concurrency adapts above it.
    #[serde(default = "d_85f")]
    pub threshold_pct: f64,
    #[serde(default = "d_5")]
    pub poll_interval_sec: u64,
    /// Extra headroom required on top of a model's estimate at load time.
    #[serde(default = "d_1f")]
    pub load_safety_margin_gb: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 85.0,
            poll_interval_sec: 5,
            load_safety_margin_gb: 1.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    /// alias → ordered preferred-model list. `auto` is built in.
    #[serde(default)]
    pub aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub default_model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Admin key for `/admin/*`. `LMX_ADMIN_KEY` env overrides. Absent
    /// disables the gate.
    #[serde(default)]
    pub admin_key: Option<String>,
    /// Optional inference key for `/v1/*`.
    #[serde(default)]
    pub inference_key: Option<String>,
    #[serde(default)]
    pub mtls: MtlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtlsConfig {
    #[serde(default)]
    pub mode: MtlsMode,
    /// Header carrying the client-certificate subject (set by the TLS
    /// terminator in front of the server).
    #[serde(default)]
    pub client_subject_header: String,
    /// When non-empty in `required` mode, only these subjects pass.
    #[serde(default)]
    pub allowed_subjects: Vec<String>,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            mode: MtlsMode::Off,
            client_subject_header: String::new(),
            allowed_subjects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MtlsMode {
    #[default]
    Off,
    Optional,
    Required,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "d_level")]
    pub level: String,
    #[serde(default = "d_true")]
    pub json: bool,
    #[serde(default)]
    pub otel: OtelConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: d_level(),
            json: true,
            otel: OtelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "d_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: d_otlp_endpoint(),
            service_name: d_service_name(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RAG facade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// External vector-store base URL. `None` turns the facade off (501).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "d_30f")]
    pub timeout_sec: f64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_sec: 30.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helper nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HelperFallback {
    /// Caller retries with the in-process equivalent.
    #[default]
    Local,
    /// Caller fails the whole request (HTTP 502).
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperNodeConfig {
    pub id: String,
    /// `embedding` or `reranking`.
    pub kind: String,
    pub base_url: String,
    #[serde(default = "d_10f")]
    pub timeout_sec: f64,
    #[serde(default)]
    pub fallback: HelperFallback,
    #[serde(default = "d_3u32")]
    pub max_retries: u32,
    #[serde(default = "d_5usize")]
    pub failure_threshold: usize,
    #[serde(default = "d_30f")]
    pub reset_timeout_sec: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetsConfig {
    /// Directory of `*.yaml` preset files.
    #[serde(default = "d_presets_dir")]
    pub directory: PathBuf,
}

impl Default for PresetsConfig {
    fn default() -> Self {
        Self {
            directory: d_presets_dir(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue backends (shared by agents scheduler + skill dispatch)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Sqlite,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "d_32")]
    pub max_steps_per_run: usize,
    #[serde(default = "d_500")]
    pub retain_completed_runs: usize,
    #[serde(default = "d_2")]
    pub step_retry_attempts: usize,
    #[serde(default = "d_500u64")]
    pub step_retry_backoff_ms: u64,
    #[serde(default = "d_4")]
    pub max_parallelism: usize,
    /// SQLite file for the durable run/idempotency records.
    #[serde(default = "d_agents_state")]
    pub state_path: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: 32,
            retain_completed_runs: 500,
            step_retry_attempts: 2,
            step_retry_backoff_ms: 500,
            max_parallelism: 4,
            state_path: d_agents_state(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "d_128")]
    pub max_queue_size: usize,
    #[serde(default = "d_2")]
    pub worker_count: usize,
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            max_queue_size: 128,
            worker_count: 2,
            persist_path: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_8")]
    pub max_concurrent_calls: usize,
    #[serde(default = "d_10f")]
    pub default_timeout_sec: f64,
    #[serde(default)]
    pub dispatcher: SkillDispatcherConfig,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            default_timeout_sec: 10.0,
            dispatcher: SkillDispatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDispatcherConfig {
    /// `local` runs skills inline; `queued` through the worker queue.
    #[serde(default = "d_local")]
    pub mode: String,
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "d_4")]
    pub worker_count: usize,
    #[serde(default = "d_256")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

impl Default for SkillDispatcherConfig {
    fn default() -> Self {
        Self {
            mode: d_local(),
            backend: QueueBackend::Memory,
            worker_count: 4,
            max_queue_size: 256,
            persist_path: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProfile {
    #[default]
    Trusted,
    Restricted,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub profile: SandboxProfile,
    /// Entrypoint modules allowed under the `restricted` profile.
    #[serde(default)]
    pub allowed_entrypoint_modules: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Journaling (external collaborator; config only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_journal_path")]
    pub path: PathBuf,
}

impl Default for JournalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: d_journal_path(),
        }
    }
}

// ── Serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    1234
}
fn d_level() -> String {
    "info".into()
}
fn d_local() -> String {
    "local".into()
}
fn d_otlp_endpoint() -> String {
    "http://127.0.0.1:4317".into()
}
fn d_service_name() -> String {
    "opta-lmx".into()
}
fn d_hub_url() -> String {
    "https://huggingface.co".into()
}
fn d_hub_token_env() -> String {
    "HF_TOKEN".into()
}
fn d_models_dir() -> PathBuf {
    PathBuf::from("./data/models")
}
fn d_presets_dir() -> PathBuf {
    PathBuf::from("./presets")
}
fn d_agents_state() -> PathBuf {
    PathBuf::from("./data/agents.db")
}
fn d_journal_path() -> PathBuf {
    PathBuf::from("./data/journal")
}
fn d_backend_preference() -> Vec<String> {
    vec!["mlx".into(), "gguf".into()]
}
fn d_0() -> u64 {
    0
}
fn d_1() -> usize {
    1
}
fn d_2() -> usize {
    2
}
fn d_4() -> usize {
    4
}
fn d_5() -> u64 {
    5
}
fn d_8() -> usize {
    8
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_32() -> usize {
    32
}
fn d_128() -> usize {
    128
}
fn d_256() -> usize {
    256
}
fn d_500() -> usize {
    500
}
fn d_500u64() -> u64 {
    500
}
fn d_3u32() -> u32 {
    3
}
fn d_20u32() -> u32 {
    20
}
fn d_5usize() -> usize {
    5
}
fn d_1f() -> f64 {
    1.0
}
fn d_10f() -> f64 {
    10.0
}
fn d_30f() -> f64 {
    30.0
}
fn d_85f() -> f64 {
    85.0
}
fn d_120f() -> f64 {
    120.0
}
fn d_300f() -> f64 {
    300.0
}
fn d_2500f() -> f64 {
    2500.0
}
fn d_true() -> bool {
    true
}
