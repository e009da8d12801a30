//! Preset manager.
//!
//! A preset is a named bundle: a real model ID, sampling defaults
//! (request-supplied values win), an optional system prompt prepended
//! when the request has none, and an optional performance profile applied
//! at load time. Presets are YAML files in the configured directory and
//! are hot-reloadable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use lmx_domain::chat::{ChatMessage, SamplingParams};
use lmx_domain::{Error, Result};

/// Request prefix that selects a preset (`preset:<name>`).
pub const PRESET_PREFIX: &str = "preset:";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresetSampling {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub sampling: PresetSampling,
    #[serde(default)]
    pub performance: HashMap<String, serde_json::Value>,
}

pub struct PresetManager {
    directory: PathBuf,
    presets: RwLock<HashMap<String, Preset>>,
}

impl PresetManager {
    pub fn new(directory: PathBuf) -> Self {
        let manager = Self {
            directory,
            presets: RwLock::new(HashMap::new()),
        };
        if let Err(e) = manager.reload() {
            tracing::warn!(error = %e, "preset load failed at startup");
        }
        manager
    }

    /// Re-read all `*.yaml` files in the preset directory. Files that fail
    /// to parse are skipped with a warning; the previous set is replaced
    /// wholesale on success.
    pub fn reload(&self) -> Result<usize> {
        if !self.directory.exists() {
            self.presets.write().clear();
            return Ok(0);
        }
        let mut fresh = HashMap::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match Self::load_file(&path) {
                Ok(preset) => {
                    fresh.insert(preset.name.clone(), preset);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid preset");
                }
            }
        }
        let count = fresh.len();
        *self.presets.write() = fresh;
        Ok(count)
    }

    fn load_file(path: &Path) -> Result<Preset> {
        let raw = std::fs::read_to_string(path)?;
        let preset: Preset = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Validation(format!("preset parse: {e}")))?;
        if preset.name.is_empty() || preset.model.is_empty() {
            return Err(Error::Validation(
                "preset requires non-empty name and model".into(),
            ));
        }
        Ok(preset)
    }

    pub fn get(&self, name: &str) -> Option<Preset> {
        self.presets.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Preset> {
        let mut presets: Vec<Preset> = self.presets.read().values().cloned().collect();
        presets.sort_by(|a, b| a.name.cmp(&b.name));
        presets
    }

    pub fn len(&self) -> usize {
        self.presets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.read().is_empty()
    }

    /// Resolve a `preset:<name>` reference. Returns the preset's model ID
    /// after applying sampling defaults (request-supplied values win) and
    /// prepending the system prompt when the messages carry none.
    pub fn apply(
        &self,
        requested: &str,
        params: &mut SamplingParams,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<Option<String>> {
        let Some(name) = requested.strip_prefix(PRESET_PREFIX) else {
            return Ok(None);
        };
        let preset = self
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(format!("preset:{name}")))?;

        if params.temperature.is_none() {
            params.temperature = preset.sampling.temperature;
        }
        if params.top_p.is_none() {
            params.top_p = preset.sampling.top_p;
        }
        if params.max_tokens.is_none() {
            params.max_tokens = preset.sampling.max_tokens;
        }

        if let Some(prompt) = &preset.system_prompt {
            let has_system = messages.iter().any(|m| m.role == "system");
            if !has_system {
                messages.insert(0, ChatMessage::system(prompt.clone()));
            }
        }

        Ok(Some(preset.model))
    }
}
