//! Typed server events fanned out by the in-process event bus.
//!
//! Consumers: the `/admin/events` SSE stream and the journaling
//! collaborator. Every variant serializes with an `event_type` tag so
//! subscribers can dispatch without downcasting.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ServerEvent {
    ModelLoaded {
        model_id: String,
        backend: String,
        backend_version: String,
    },
    ModelUnloaded {
        model_id: String,
    },
    ModelQuarantined {
        model_id: String,
        backend: String,
        reason: String,
    },
    DownloadStarted {
        download_id: String,
        repo_id: String,
    },
    DownloadCompleted {
        download_id: String,
        repo_id: String,
    },
    DownloadFailed {
        download_id: String,
        repo_id: String,
        error: String,
    },
    ConfigReloaded {
        changed: Vec<String>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// SSE `event:` name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ModelLoaded { .. } => "model_loaded",
            ServerEvent::ModelUnloaded { .. } => "model_unloaded",
            ServerEvent::ModelQuarantined { .. } => "model_quarantined",
            ServerEvent::DownloadStarted { .. } => "download_started",
            ServerEvent::DownloadCompleted { .. } => "download_completed",
            ServerEvent::DownloadFailed { .. } => "download_failed",
            ServerEvent::ConfigReloaded { .. } => "config_reloaded",
            ServerEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serialization() {
        let event = ServerEvent::ModelLoaded {
            model_id: "m".into(),
            backend: "mlx".into(),
            backend_version: "0.3".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"model_loaded\""));
        assert_eq!(event.name(), "model_loaded");
    }
}
