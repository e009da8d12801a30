//! Backend abstraction.
//!
//! The tensor runtime is an external collaborator: from our side a backend
//! is an opaque capability that turns messages into tokens. The engine
//! constructs backends through a [`BackendFactory`] so the runtime wiring
//! (HTTP endpoints today) stays out of the lifecycle logic.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lmx_domain::chat::{ChatMessage, SamplingParams, Usage};
use lmx_domain::stream::BoxStream;
use lmx_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Primary tensor runtime.
    Mlx,
    /// GGUF fallback runtime.
    Gguf,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Mlx => "mlx",
            BackendKind::Gguf => "gguf",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "mlx" => Some(BackendKind::Mlx),
            "gguf" => Some(BackendKind::Gguf),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Performance profile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SpeculativeSpec {
    #[serde(default)]
    pub draft_model: Option<String>,
    #[serde(default = "d_num_tokens")]
    pub num_tokens: u32,
    #[serde(default)]
    pub require_supported: bool,
}

fn d_num_tokens() -> u32 {
    4
}

/// Live speculative-decoding status on a loaded model.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct SpeculativeStatus {
    pub requested: bool,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_model: Option<String>,
    pub num_tokens: u32,
}

/// Sparse key-value set recognized by backend constructors.
///
/// Unrecognized keys are carried through in `extra` so future backends can
/// pick them up without a schema change.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PerformanceProfile {
    #[serde(default)]
    pub kv_bits: Option<u8>,
    #[serde(default)]
    pub kv_group_size: Option<u32>,
    #[serde(default)]
    pub prefix_cache: Option<bool>,
    #[serde(default)]
    pub speculative: Option<SpeculativeSpec>,
    /// Metadata only — never forwarded to the backend.
    #[serde(default)]
    pub memory_estimate_gb: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl PerformanceProfile {
    /// Parse a raw key-value map (config/preset/request form).
    pub fn from_map(map: &HashMap<String, serde_json::Value>) -> Result<Self> {
        let value = serde_json::to_value(map)?;
        serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("performance profile: {e}")))
    }

    /// Layered merge: `self` (engine globals) ← `over` (preset or request
    /// overrides). Values present in `over` win; `extra` keys merge.
    pub fn merged_with(&self, over: &PerformanceProfile) -> PerformanceProfile {
        let mut extra = self.extra.clone();
        extra.extend(over.extra.clone());
        PerformanceProfile {
            kv_bits: over.kv_bits.or(self.kv_bits),
            kv_group_size: over.kv_group_size.or(self.kv_group_size),
            prefix_cache: over.prefix_cache.or(self.prefix_cache),
            speculative: over.speculative.clone().or_else(|| self.speculative.clone()),
            memory_estimate_gb: over.memory_estimate_gb.or(self.memory_estimate_gb),
            extra,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One raw token from a backend stream. `from_draft` is the speculative
/// telemetry flag; `None` means the backend does not report it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendToken {
    pub text: String,
    pub from_draft: Option<bool>,
}

impl BackendToken {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from_draft: None,
        }
    }
}

/// Non-streaming generation result.
#[derive(Debug, Clone)]
pub struct BackendCompletion {
    pub text: String,
    pub usage: Usage,
}

pub type BackendTokenStream = BoxStream<'static, Result<BackendToken>>;

/// Opaque token producer. Exclusively owned by one registry entry; the
/// engine calls `close` exactly once, on unload.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<BackendCompletion>;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<BackendTokenStream>;

    fn kind(&self) -> BackendKind;

    fn version(&self) -> &str;

    fn context_length(&self) -> u32;

    /// Whether this backend accepted the speculative profile keys.
    fn speculative_supported(&self) -> bool {
        false
    }

    /// Best-effort resident-memory estimate for the loaded weights.
    fn estimated_memory_bytes(&self) -> u64 {
        0
    }

    async fn close(&self);
}

/// Constructs backends for the engine.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Cheap bring-up check run under the loader supervisor before the
    /// in-process load is attempted.
    async fn probe(&self, model_id: &str, kind: BackendKind) -> Result<()>;

    async fn create(
        &self,
        model_id: &str,
        kind: BackendKind,
        profile: &PerformanceProfile,
    ) -> Result<std::sync::Arc<dyn Backend>>;
}
