//! Agent run and step records.
//!
//! Terminal run states are absorbing: once a run is completed, failed, or
//! cancelled it never returns to queued/running. Steps are only mutated
//! after a terminal state during whole-run cancellation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lmx_domain::chat::Priority;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    WaitingApproval,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::WaitingApproval => "waiting_approval",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPriority {
    Interactive,
    #[default]
    Normal,
    Batch,
}

impl RunPriority {
    /// Queue rank: lower dispatches first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Interactive => 0,
            Self::Normal => 1,
            Self::Batch => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Normal => "normal",
            Self::Batch => "batch",
        }
    }

    /// Inference-lane priority for steps of a run at this priority.
    pub fn inference_priority(self) -> Priority {
        match self {
            Self::Interactive => Priority::High,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Sequential; step i receives `prev_output:input`.
    #[default]
    Handoff,
    /// All roles run concurrently with the shared input.
    ParallelMap,
    /// Roles run in the fixed role ordering; first failure stops the run.
    Router,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_auto() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(default = "d_auto")]
    pub model: String,
    pub input: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub role_models: HashMap<String, String>,
    #[serde(default)]
    pub role_system_prompts: HashMap<String, String>,
    #[serde(default)]
    pub role_tools: HashMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default)]
    pub cost_budget_usd: Option<f64>,
    #[serde(default)]
    pub priority: RunPriority,
    #[serde(default)]
    pub timeout_sec: Option<f64>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub traceparent: Option<String>,
    #[serde(default)]
    pub tracestate: Option<String>,
}

impl AgentRequest {
    /// Case-insensitive role-override lookup (exact match wins).
    pub fn model_for_role(&self, role: &str) -> Option<&str> {
        lookup_role(&self.role_models, role).map(String::as_str)
    }

    pub fn system_prompt_for_role(&self, role: &str) -> String {
        lookup_role(&self.role_system_prompts, role)
            .cloned()
            .unwrap_or_else(|| format!("You are acting as the {role} agent."))
    }

    pub fn tools_for_role(&self, role: &str) -> Option<&Vec<serde_json::Value>> {
        lookup_role(&self.role_tools, role)
    }
}

fn lookup_role<'a, V>(map: &'a HashMap<String, V>, role: &str) -> Option<&'a V> {
    if let Some(value) = map.get(role) {
        return Some(value);
    }
    let role_lower = role.to_lowercase();
    map.iter()
        .find(|(key, _)| key.to_lowercase() == role_lower)
        .map(|(_, value)| value)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step & run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub role: String,
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    pub fn new(role: &str, input: String) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            role: role.to_string(),
            input,
            output: None,
            status: StepStatus::Queued,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub request: AgentRequest,
    pub status: RunStatus,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub resolved_model: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    /// Last completed step ID, for resumable recovery downstream.
    #[serde(default)]
    pub checkpoint_pointer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentRun {
    pub fn new(request: AgentRequest, status: RunStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            request,
            status,
            steps: Vec::new(),
            result: None,
            resolved_model: None,
            tokens_used: 0,
            estimated_cost_usd: 0.0,
            checkpoint_pointer: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn priority_ranks_order_queue() {
        assert!(RunPriority::Interactive.rank() < RunPriority::Normal.rank());
        assert!(RunPriority::Normal.rank() < RunPriority::Batch.rank());
        assert_eq!(
            RunPriority::Interactive.inference_priority(),
            Priority::High
        );
        assert_eq!(RunPriority::Batch.inference_priority(), Priority::Normal);
    }

    #[test]
    fn role_lookup_case_insensitive() {
        let mut request: AgentRequest = serde_json::from_value(serde_json::json!({
            "input": "x",
            "roles": ["Coder"],
        }))
        .unwrap();
        request
            .role_models
            .insert("coder".to_string(), "small".to_string());
        assert_eq!(request.model_for_role("Coder"), Some("small"));
        assert_eq!(request.model_for_role("reviewer"), None);
        assert!(request
            .system_prompt_for_role("reviewer")
            .contains("reviewer agent"));
    }

    #[test]
    fn request_defaults() {
        let request: AgentRequest = serde_json::from_value(serde_json::json!({
            "input": "do things",
            "roles": ["planner", "coder"],
        }))
        .unwrap();
        assert_eq!(request.model, "auto");
        assert_eq!(request.strategy, ExecutionStrategy::Handoff);
        assert_eq!(request.priority, RunPriority::Normal);
        assert!(!request.approval_required);
    }

    #[test]
    fn run_serde_roundtrip() {
        let request: AgentRequest = serde_json::from_value(serde_json::json!({
            "input": "x",
            "roles": ["a"],
        }))
        .unwrap();
        let mut run = AgentRun::new(request, RunStatus::Queued);
        run.steps.push(Step::new("a", "x".into()));
        let json = serde_json::to_string(&run).unwrap();
        let parsed: AgentRun = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, run.id);
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.status, RunStatus::Queued);
    }
}
