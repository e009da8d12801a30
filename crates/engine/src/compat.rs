//! Compatibility registry — append-only record of load/runtime outcomes
//! per (model, backend kind, backend version).
//!
//! Reads produce an ordered backend candidate list for a model; writes
//! happen on every successful load, canary failure, and runtime
//! quarantine. Records are mirrored to a JSONL file so quarantine
//! decisions survive restarts.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lmx_domain::Result;

use crate::backend::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatOutcome {
    Pass,
    Fail,
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityRecord {
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub backend: BackendKind,
    pub backend_version: String,
    pub outcome: CompatOutcome,
    pub reason: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub struct CompatibilityRegistry {
    records: Mutex<Vec<CompatibilityRecord>>,
    persist_path: Option<PathBuf>,
}

impl CompatibilityRegistry {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let records = persist_path
            .as_deref()
            .map(Self::load_jsonl)
            .unwrap_or_default();
        Self {
            records: Mutex::new(records),
            persist_path,
        }
    }

    fn load_jsonl(path: &std::path::Path) -> Vec<CompatibilityRecord> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Append one record (and mirror it to disk when configured).
    pub fn record(
        &self,
        model_id: &str,
        backend: BackendKind,
        backend_version: &str,
        outcome: CompatOutcome,
        reason: &str,
    ) -> Result<()> {
        let record = CompatibilityRecord {
            timestamp: Utc::now(),
            model_id: model_id.to_string(),
            backend,
            backend_version: backend_version.to_string(),
            outcome,
            reason: reason.to_string(),
            metadata: serde_json::Map::new(),
        };

        if let Some(path) = &self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{line}")?;
        }

        self.records.lock().push(record);
        Ok(())
    }

    /// All records for a model, oldest first.
    pub fn records_for(&self, model_id: &str) -> Vec<CompatibilityRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.model_id == model_id)
            .cloned()
            .collect()
    }

    /// Latest outcome for a (model, backend) pair.
    pub fn latest_outcome(&self, model_id: &str, backend: BackendKind) -> Option<CompatOutcome> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.model_id == model_id && r.backend == backend)
            .map(|r| r.outcome)
    }

    pub fn is_quarantined(&self, model_id: &str, backend: BackendKind) -> bool {
        self.latest_outcome(model_id, backend) == Some(CompatOutcome::Quarantine)
    }

    /// Ordered backend candidate list for a model.
    ///
    /// Starts from the configured preference, drops quarantined kinds, and
    /// moves any kind with a latest `pass` outcome to the front (stable
    /// within each group).
    pub fn candidate_backends(
        &self,
        model_id: &str,
        preference: &[BackendKind],
    ) -> Vec<BackendKind> {
        let mut passed = Vec::new();
        let mut untried = Vec::new();
        for &kind in preference {
            match self.latest_outcome(model_id, kind) {
                Some(CompatOutcome::Quarantine) => continue,
                Some(CompatOutcome::Pass) => passed.push(kind),
                _ => untried.push(kind),
            }
        }
        passed.extend(untried);
        passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFERENCE: &[BackendKind] = &[BackendKind::Mlx, BackendKind::Gguf];

    #[test]
    fn empty_registry_keeps_preference_order() {
        let registry = CompatibilityRegistry::new(None);
        assert_eq!(
            registry.candidate_backends("m", PREFERENCE),
            vec![BackendKind::Mlx, BackendKind::Gguf]
        );
    }

    #[test]
    fn pass_moves_backend_to_front() {
        let registry = CompatibilityRegistry::new(None);
        registry
            .record("m", BackendKind::Gguf, "1.0", CompatOutcome::Pass, "loaded")
            .unwrap();
        assert_eq!(
            registry.candidate_backends("m", PREFERENCE),
            vec![BackendKind::Gguf, BackendKind::Mlx]
        );
    }

    #[test]
    fn quarantine_removes_backend() {
        let registry = CompatibilityRegistry::new(None);
        registry
            .record(
                "m",
                BackendKind::Mlx,
                "1.0",
                CompatOutcome::Quarantine,
                "metal fault",
            )
            .unwrap();
        assert_eq!(
            registry.candidate_backends("m", PREFERENCE),
            vec![BackendKind::Gguf]
        );
        assert!(registry.is_quarantined("m", BackendKind::Mlx));
        // Other models are unaffected.
        assert!(!registry.is_quarantined("other", BackendKind::Mlx));
    }

    #[test]
    fn latest_outcome_wins() {
        let registry = CompatibilityRegistry::new(None);
        registry
            .record("m", BackendKind::Mlx, "1.0", CompatOutcome::Fail, "oom")
            .unwrap();
        registry
            .record("m", BackendKind::Mlx, "1.1", CompatOutcome::Pass, "loaded")
            .unwrap();
        assert_eq!(
            registry.latest_outcome("m", BackendKind::Mlx),
            Some(CompatOutcome::Pass)
        );
    }

    #[test]
    fn records_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compat.jsonl");

        {
            let registry = CompatibilityRegistry::new(Some(path.clone()));
            registry
                .record(
                    "m",
                    BackendKind::Mlx,
                    "1.0",
                    CompatOutcome::Quarantine,
                    "crash",
                )
                .unwrap();
        }

        let reloaded = CompatibilityRegistry::new(Some(path));
        assert!(reloaded.is_quarantined("m", BackendKind::Mlx));
        assert_eq!(reloaded.records_for("m").len(), 1);
    }
}
