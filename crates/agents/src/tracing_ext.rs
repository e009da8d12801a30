//! Run tracing abstraction.
//!
//! Trace events carry the request's `traceparent`/`tracestate` so an
//! external collector can stitch runs into a distributed trace. The
//! default sink writes structured log lines.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::RunStatus;

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub run_id: String,
    pub event: &'static str,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    pub fn new(run_id: &str, event: &'static str, status: RunStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            event,
            status,
            message: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

pub trait Tracer: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Discards everything.
#[derive(Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn emit(&self, _event: TraceEvent) {}
}

/// Writes trace events as structured log lines.
#[derive(Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn emit(&self, event: TraceEvent) {
        tracing::info!(
            run_id = %event.run_id,
            event = event.event,
            status = event.status.as_str(),
            message = event.message.as_deref().unwrap_or(""),
            traceparent = event.metadata.get("traceparent").map(String::as_str).unwrap_or(""),
            "agent trace"
        );
    }
}

/// Collects events in memory; used by tests.
#[derive(Default)]
pub struct RecordingTracer {
    events: parking_lot::Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event).collect()
    }
}

impl Tracer for RecordingTracer {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_tracer_captures_order() {
        let tracer = RecordingTracer::default();
        tracer.emit(TraceEvent::new("r1", "run_submitted", RunStatus::Queued));
        tracer.emit(
            TraceEvent::new("r1", "run_started", RunStatus::Running).with_message("go"),
        );
        assert_eq!(tracer.event_names(), vec!["run_submitted", "run_started"]);
        assert_eq!(tracer.events()[1].message.as_deref(), Some("go"));
    }
}
