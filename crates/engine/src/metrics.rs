//! In-process metrics: per-request and per-model counters, latency
//! histograms, speculative-decoding stats, and agent-run outcomes.
//!
//! Two render paths: Prometheus exposition text and a JSON view for the
//! admin surface. Both read the same parking_lot-guarded state.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Fixed latency buckets (seconds), Prometheus-style cumulative.
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

#[derive(Debug, Default, Clone, Serialize)]
pub struct ModelMetrics {
    pub requests_total: u64,
    pub errors_total: u64,
    pub prompt_tokens_total: u64,
    pub completion_tokens_total: u64,
    pub latency_sum_sec: f64,
    pub latency_count: u64,
    #[serde(skip)]
    pub latency_buckets: Vec<u64>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SpeculativeMetrics {
    pub accepted_tokens: u64,
    pub rejected_tokens: u64,
    pub ignored_tokens: u64,
    pub streams_with_telemetry: u64,
    pub streams_without_telemetry: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AgentRunMetrics {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub duration_sum_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub model_id: String,
    pub latency_sec: f64,
    pub queue_wait_sec: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub error: bool,
}

#[derive(Default)]
struct MetricsState {
    by_model: HashMap<String, ModelMetrics>,
    speculative: HashMap<String, SpeculativeMetrics>,
    agent_runs: AgentRunMetrics,
    queue_wait_sum_sec: f64,
    queue_wait_count: u64,
}

#[derive(Default)]
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, record: RequestRecord) {
        let mut state = self.state.lock();
        state.queue_wait_sum_sec += record.queue_wait_sec;
        state.queue_wait_count += 1;

        let entry = state.by_model.entry(record.model_id).or_default();
        if entry.latency_buckets.is_empty() {
            entry.latency_buckets = vec![0; LATENCY_BUCKETS.len()];
        }
        entry.requests_total += 1;
        if record.error {
            entry.errors_total += 1;
        }
        entry.prompt_tokens_total += u64::from(record.prompt_tokens);
        entry.completion_tokens_total += u64::from(record.completion_tokens);
        entry.latency_sum_sec += record.latency_sec;
        entry.latency_count += 1;
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if record.latency_sec <= *bound {
                entry.latency_buckets[i] += 1;
            }
        }
    }

    pub fn record_speculative(
        &self,
        model_id: &str,
        accepted: u64,
        rejected: u64,
        ignored: u64,
        telemetry_available: bool,
    ) {
        let mut state = self.state.lock();
        let entry = state.speculative.entry(model_id.to_string()).or_default();
        entry.accepted_tokens += accepted;
        entry.rejected_tokens += rejected;
        entry.ignored_tokens += ignored;
        if telemetry_available {
            entry.streams_with_telemetry += 1;
        } else {
            entry.streams_without_telemetry += 1;
        }
    }

    pub fn record_agent_run(&self, status: &str, duration_sec: f64) {
        let mut state = self.state.lock();
        match status {
            "completed" => state.agent_runs.completed += 1,
            "cancelled" => state.agent_runs.cancelled += 1,
            _ => state.agent_runs.failed += 1,
        }
        state.agent_runs.duration_sum_sec += duration_sec;
    }

    pub fn speculative_for(&self, model_id: &str) -> SpeculativeMetrics {
        self.state
            .lock()
            .speculative
            .get(model_id)
            .copied()
            .unwrap_or_default()
    }

    /// JSON view for `/admin/metrics?format=json`.
    pub fn json_view(&self) -> serde_json::Value {
        let state = self.state.lock();
        let models: serde_json::Map<String, serde_json::Value> = state
            .by_model
            .iter()
            .map(|(id, m)| {
                let avg = if m.latency_count > 0 {
                    m.latency_sum_sec / m.latency_count as f64
                } else {
                    0.0
                };
                (
                    id.clone(),
                    serde_json::json!({
                        "requests_total": m.requests_total,
                        "errors_total": m.errors_total,
                        "prompt_tokens_total": m.prompt_tokens_total,
                        "completion_tokens_total": m.completion_tokens_total,
                        "avg_latency_sec": avg,
                    }),
                )
            })
            .collect();
        let avg_queue_wait = if state.queue_wait_count > 0 {
            state.queue_wait_sum_sec / state.queue_wait_count as f64
        } else {
            0.0
        };
        serde_json::json!({
            "models": models,
            "speculative": state.speculative,
            "agent_runs": state.agent_runs,
            "avg_queue_wait_sec": avg_queue_wait,
        })
    }

    /// Prometheus exposition format for `/admin/metrics`.
    pub fn prometheus_view(&self) -> String {
        let state = self.state.lock();
        let mut out = String::with_capacity(2048);

        out.push_str("# TYPE lmx_requests_total counter\n");
        for (id, m) in &state.by_model {
            out.push_str(&format!(
                "lmx_requests_total{{model=\"{id}\"}} {}\n",
                m.requests_total
            ));
        }
        out.push_str("# TYPE lmx_request_errors_total counter\n");
        for (id, m) in &state.by_model {
            out.push_str(&format!(
                "lmx_request_errors_total{{model=\"{id}\"}} {}\n",
                m.errors_total
            ));
        }
        out.push_str("# TYPE lmx_tokens_total counter\n");
        for (id, m) in &state.by_model {
            out.push_str(&format!(
                "lmx_tokens_total{{model=\"{id}\",kind=\"prompt\"}} {}\n",
                m.prompt_tokens_total
            ));
            out.push_str(&format!(
                "lmx_tokens_total{{model=\"{id}\",kind=\"completion\"}} {}\n",
                m.completion_tokens_total
            ));
        }
        out.push_str("# TYPE lmx_request_latency_seconds histogram\n");
        for (id, m) in &state.by_model {
            for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
                let count = m.latency_buckets.get(i).copied().unwrap_or(0);
                out.push_str(&format!(
                    "lmx_request_latency_seconds_bucket{{model=\"{id}\",le=\"{bound}\"}} {count}\n"
                ));
            }
            out.push_str(&format!(
                "lmx_request_latency_seconds_bucket{{model=\"{id}\",le=\"+Inf\"}} {}\n",
                m.latency_count
            ));
            out.push_str(&format!(
                "lmx_request_latency_seconds_sum{{model=\"{id}\"}} {}\n",
                m.latency_sum_sec
            ));
            out.push_str(&format!(
                "lmx_request_latency_seconds_count{{model=\"{id}\"}} {}\n",
                m.latency_count
            ));
        }
        out.push_str("# TYPE lmx_speculative_tokens_total counter\n");
        for (id, s) in &state.speculative {
            out.push_str(&format!(
                "lmx_speculative_tokens_total{{model=\"{id}\",outcome=\"accepted\"}} {}\n",
                s.accepted_tokens
            ));
            out.push_str(&format!(
                "lmx_speculative_tokens_total{{model=\"{id}\",outcome=\"rejected\"}} {}\n",
                s.rejected_tokens
            ));
            out.push_str(&format!(
                "lmx_speculative_tokens_total{{model=\"{id}\",outcome=\"ignored\"}} {}\n",
                s.ignored_tokens
            ));
        }
        out.push_str("# TYPE lmx_agent_runs_total counter\n");
        out.push_str(&format!(
            "lmx_agent_runs_total{{status=\"completed\"}} {}\n",
            state.agent_runs.completed
        ));
        out.push_str(&format!(
            "lmx_agent_runs_total{{status=\"failed\"}} {}\n",
            state.agent_runs.failed
        ));
        out.push_str(&format!(
            "lmx_agent_runs_total{{status=\"cancelled\"}} {}\n",
            state.agent_runs.cancelled
        ));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, latency: f64, error: bool) -> RequestRecord {
        RequestRecord {
            model_id: model.to_string(),
            latency_sec: latency,
            queue_wait_sec: 0.01,
            prompt_tokens: 10,
            completion_tokens: 20,
            error,
        }
    }

    #[test]
    fn request_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_request(record("m", 0.2, false));
        metrics.record_request(record("m", 1.5, true));

        let json = metrics.json_view();
        let m = &json["models"]["m"];
        assert_eq!(m["requests_total"], 2);
        assert_eq!(m["errors_total"], 1);
        assert_eq!(m["prompt_tokens_total"], 20);
        assert_eq!(m["completion_tokens_total"], 40);
    }

    #[test]
    fn prometheus_output_contains_series() {
        let metrics = MetricsCollector::new();
        metrics.record_request(record("m", 0.2, false));
        metrics.record_speculative("m", 5, 1, 0, true);
        metrics.record_agent_run("completed", 2.0);

        let text = metrics.prometheus_view();
        assert!(text.contains("lmx_requests_total{model=\"m\"} 1"));
        assert!(text.contains("lmx_request_latency_seconds_bucket{model=\"m\",le=\"0.25\"} 1"));
        assert!(text.contains("le=\"+Inf\"} 1"));
        assert!(text.contains("lmx_speculative_tokens_total{model=\"m\",outcome=\"accepted\"} 5"));
        assert!(text.contains("lmx_agent_runs_total{status=\"completed\"} 1"));
    }

    #[test]
    fn histogram_buckets_cumulative() {
        let metrics = MetricsCollector::new();
        metrics.record_request(record("m", 0.05, false)); // lands in every bucket
        metrics.record_request(record("m", 50.0, false)); // only the top buckets

        let state = metrics.state.lock();
        let m = &state.by_model["m"];
        assert_eq!(m.latency_buckets[0], 1); // <= 0.1
        assert_eq!(m.latency_buckets[LATENCY_BUCKETS.len() - 1], 2); // <= 120
    }

    #[test]
    fn agent_run_outcomes() {
        let metrics = MetricsCollector::new();
        metrics.record_agent_run("completed", 1.0);
        metrics.record_agent_run("failed", 1.0);
        metrics.record_agent_run("cancelled", 1.0);
        let json = metrics.json_view();
        assert_eq!(json["agent_runs"]["completed"], 1);
        assert_eq!(json["agent_runs"]["failed"], 1);
        assert_eq!(json["agent_runs"]["cancelled"], 1);
    }

    #[test]
    fn speculative_telemetry_split() {
        let metrics = MetricsCollector::new();
        metrics.record_speculative("m", 0, 0, 7, false);
        let s = metrics.speculative_for("m");
        assert_eq!(s.ignored_tokens, 7);
        assert_eq!(s.streams_without_telemetry, 1);
    }
}
