//! Agent runtime — executes multi-step runs against the inference engine
//! with budgets, retries, priority, idempotency, persistence, and live
//! cancellation.
//!
//! The engine is reached through the narrow [`EngineHandle`] seam so the
//! runtime never depends on lifecycle internals. Every state change is
//! written to the state store; on startup any run still in
//! queued/running is rewritten to failed before workers resume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};

use lmx_domain::chat::{ChatMessage, Completion, Priority, SamplingParams};
use lmx_domain::config::AgentsConfig;
use lmx_domain::{Error, Result};
use lmx_engine::metrics::MetricsCollector;
use lmx_engine::router::TaskRouter;

use crate::graph;
use crate::models::{
    AgentRequest, AgentRun, ExecutionStrategy, RunStatus, StepStatus,
};
use crate::scheduler::{RunHandler, RunScheduler};
use crate::state_store::AgentsStateStore;
use crate::tracing_ext::{TraceEvent, Tracer};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Subset of the inference engine the runtime needs.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn loaded_model_ids(&self) -> Vec<String>;

    fn is_model_loaded(&self, model_id: &str) -> bool;

    fn model_load_snapshot(&self, model_ids: &[String]) -> HashMap<String, f64>;

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
        priority: Priority,
        client_id: Option<&str>,
    ) -> Result<Completion>;
}

#[async_trait]
impl EngineHandle for lmx_engine::InferenceEngine {
    fn loaded_model_ids(&self) -> Vec<String> {
        self.loaded_ids()
    }

    fn is_model_loaded(&self, model_id: &str) -> bool {
        self.is_loaded(model_id)
    }

    fn model_load_snapshot(&self, model_ids: &[String]) -> HashMap<String, f64> {
        lmx_engine::InferenceEngine::model_load_snapshot(self, model_ids)
    }

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
        priority: Priority,
        client_id: Option<&str>,
    ) -> Result<Completion> {
        lmx_engine::InferenceEngine::generate(self, model_id, messages, params, priority, client_id)
            .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub max_steps_per_run: usize,
    pub retain_completed_runs: usize,
    pub step_retry_attempts: usize,
    pub step_retry_backoff: Duration,
    pub max_parallelism: usize,
    /// USD accrued per 1k tokens toward the cost budget. Zero disables
    /// cost accounting.
    pub cost_per_1k_tokens: f64,
}

impl RuntimeOptions {
    pub fn from_config(config: &AgentsConfig) -> Self {
        Self {
            max_steps_per_run: config.max_steps_per_run.max(1),
            retain_completed_runs: config.retain_completed_runs,
            step_retry_attempts: config.step_retry_attempts,
            step_retry_backoff: Duration::from_millis(config.step_retry_backoff_ms),
            max_parallelism: config.max_parallelism.max(1),
            cost_per_1k_tokens: 0.0,
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_steps_per_run: 32,
            retain_completed_runs: 500,
            step_retry_attempts: 2,
            step_retry_backoff: Duration::from_millis(500),
            max_parallelism: 4,
            cost_per_1k_tokens: 0.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentsRuntime {
    engine: Arc<dyn EngineHandle>,
    router: Arc<RwLock<TaskRouter>>,
    tracer: Arc<dyn Tracer>,
    metrics: Option<Arc<MetricsCollector>>,
    state_store: Arc<AgentsStateStore>,
    scheduler: Arc<RunScheduler>,
    options: RuntimeOptions,

    runs: Mutex<HashMap<String, AgentRun>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    submit_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl AgentsRuntime {
    pub fn new(
        engine: Arc<dyn EngineHandle>,
        router: Arc<RwLock<TaskRouter>>,
        tracer: Arc<dyn Tracer>,
        metrics: Option<Arc<MetricsCollector>>,
        state_store: Arc<AgentsStateStore>,
        scheduler: Arc<RunScheduler>,
        options: RuntimeOptions,
    ) -> Result<Self> {
        let mut runs = HashMap::new();
        for run in state_store.list_runs()? {
            runs.insert(run.id.clone(), run);
        }
        let runtime = Self {
            engine,
            router,
            tracer,
            metrics,
            state_store,
            scheduler,
            options,
            runs: Mutex::new(runs),
            cancel_flags: Mutex::new(HashMap::new()),
            submit_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
        };
        runtime.restore_incomplete_runs()?;
        Ok(runtime)
    }

    /// Runs interrupted by a restart are rewritten to failed before any
    /// worker resumes; the checkpoint pointer stays for downstream replay.
    fn restore_incomplete_runs(&self) -> Result<()> {
        let mut runs = self.runs.lock();
        for run in runs.values_mut() {
            if matches!(run.status, RunStatus::Queued | RunStatus::Running) {
                run.status = RunStatus::Failed;
                run.error = Some(
                    "Run was interrupted before completion and was marked failed on startup."
                        .to_string(),
                );
                run.updated_at = Utc::now();
                self.state_store.upsert_run(run)?;
                tracing::info!(
                    run_id = %run.id,
                    checkpoint_pointer = run.checkpoint_pointer.as_deref().unwrap_or(""),
                    "interrupted run restored as failed"
                );
            }
        }
        Ok(())
    }

    /// Start queue workers. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = Arc::downgrade(self);
        let handler: RunHandler = Arc::new(move |run_id| {
            let runtime = runtime.clone();
            Box::pin(async move {
                if let Some(runtime) = runtime.upgrade() {
                    runtime.execute_run(&run_id).await;
                }
            })
        });
        self.scheduler.start(handler);
    }

    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.scheduler.stop().await;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // ── Submit ─────────────────────────────────────────────────────────

    pub async fn submit(
        &self,
        request: AgentRequest,
        idempotency_key: Option<&str>,
        idempotency_fingerprint: &str,
    ) -> Result<AgentRun> {
        if !self.is_started() {
            return Err(Error::Internal("agents runtime is not started".into()));
        }
        if request.roles.is_empty() {
            return Err(Error::Validation("roles must be non-empty".into()));
        }
        if request.roles.len() > self.options.max_steps_per_run {
            return Err(Error::Validation(format!(
                "Run has {} steps but max_steps_per_run is {}.",
                request.roles.len(),
                self.options.max_steps_per_run
            )));
        }
        let key = idempotency_key.map(str::trim).unwrap_or("");

        let _guard = self.submit_lock.lock().await;

        if !key.is_empty() {
            if let Some((run_id, stored_fingerprint)) = self.state_store.get_idempotency(key)? {
                if !stored_fingerprint.is_empty()
                    && !idempotency_fingerprint.is_empty()
                    && stored_fingerprint != idempotency_fingerprint
                {
                    return Err(Error::Validation(
                        "Idempotency key already used with a different request payload.".into(),
                    ));
                }
                let existing = {
                    let runs = self.runs.lock();
                    runs.get(&run_id).cloned()
                };
                let existing = match existing {
                    Some(run) => Some(run),
                    None => {
                        let from_store = self.state_store.get_run(&run_id)?;
                        if let Some(run) = &from_store {
                            self.runs.lock().insert(run_id.clone(), run.clone());
                        }
                        from_store
                    }
                };
                match existing {
                    Some(run) => return Ok(run),
                    None => self.state_store.clear_idempotency(key)?,
                }
            }
        }

        let status = if request.approval_required {
            RunStatus::WaitingApproval
        } else {
            RunStatus::Queued
        };
        let priority = request.priority;
        let mut run = AgentRun::new(request, status);
        run.steps = graph::build_steps(&run.request);
        self.record_run(&run)?;
        if !key.is_empty() {
            self.state_store
                .bind_idempotency(key, &run.id, idempotency_fingerprint)?;
        }
        self.trace(&run, "run_submitted", None);

        if run.status == RunStatus::Queued {
            if let Err(e) = self.scheduler.submit(&run.id, priority) {
                run.status = RunStatus::Failed;
                run.error = Some(format!("{e}. Retry when queue pressure drops."));
                run.updated_at = Utc::now();
                self.record_run(&run)?;
                self.trace(&run, "run_submission_failed", run.error.clone());
            }
        }

        Ok(run)
    }

    /// Release a run that was submitted with `approval_required`.
    pub async fn approve(&self, run_id: &str) -> Result<AgentRun> {
        let run = {
            let mut runs = self.runs.lock();
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| Error::ModelNotFound(format!("run {run_id}")))?;
            if run.status != RunStatus::WaitingApproval {
                return Err(Error::Validation(format!(
                    "run is {} and cannot be approved",
                    run.status.as_str()
                )));
            }
            run.status = RunStatus::Queued;
            run.updated_at = Utc::now();
            run.clone()
        };
        self.state_store.upsert_run(&run)?;
        self.scheduler.submit(&run.id, run.request.priority)?;
        Ok(run)
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn get(&self, run_id: &str) -> Option<AgentRun> {
        self.runs.lock().get(run_id).cloned()
    }

    pub fn list(&self, status: Option<RunStatus>) -> Vec<AgentRun> {
        let mut runs: Vec<AgentRun> = self
            .runs
            .lock()
            .values()
            .filter(|run| status.map_or(true, |s| run.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    // ── Cancel ─────────────────────────────────────────────────────────

    /// Cancel a queued or running run. Steps already begun observe the
    /// cancellation between backend calls.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let cancelled = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                return false;
            };
            if run.status.is_terminal() {
                return run.status == RunStatus::Cancelled;
            }
            mark_run_cancelled(run, "Run cancelled");
            run.clone()
        };
        if let Err(e) = self.state_store.upsert_run(&cancelled) {
            tracing::warn!(run_id, error = %e, "cancel persistence failed");
        }
        if let Some(flag) = self.cancel_flags.lock().get(run_id) {
            flag.store(true, Ordering::Release);
        }
        self.trace(&cancelled, "run_cancelled", None);
        true
    }

    // ── Execution ──────────────────────────────────────────────────────

    async fn execute_run(self: &Arc<Self>, run_id: &str) {
        let run = {
            let runs = self.runs.lock();
            let Some(run) = runs.get(run_id) else { return };
            if run.status.is_terminal() || run.status == RunStatus::WaitingApproval {
                return;
            }
            run.clone()
        };
        let started = Instant::now();

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .insert(run_id.to_string(), cancel_flag.clone());

        let _ = self.update_run(run_id, |run| {
            if !run.status.is_terminal() {
                run.status = RunStatus::Running;
                run.error = None;
            }
        });
        // A cancel that landed between the queue claim and the flag
        // registration already finished the run.
        if self
            .get(run_id)
            .map(|run| run.status.is_terminal())
            .unwrap_or(true)
        {
            self.cancel_flags.lock().remove(run_id);
            return;
        }
        self.trace_by_id(run_id, "run_started", None);

        let execution = self.execute_steps(run_id, &run.request, cancel_flag.clone());
        let outcome = match run.request.timeout_sec {
            Some(timeout_sec) => {
                match tokio::time::timeout(Duration::from_secs_f64(timeout_sec), execution).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::RequestTimeout(timeout_sec)),
                }
            }
            None => execution.await,
        };

        let _ = self.update_run(run_id, |run| {
            if run.status == RunStatus::Cancelled {
                return;
            }
            match &outcome {
                Ok(result) => {
                    run.status = RunStatus::Completed;
                    run.result = Some(result.clone());
                    run.error = None;
                }
                Err(Error::RequestTimeout(_)) => {
                    run.status = RunStatus::Failed;
                    run.error = Some("Run exceeded configured timeout".to_string());
                }
                Err(e) => {
                    run.status = RunStatus::Failed;
                    run.error = Some(e.to_string());
                }
            }
        });

        self.cancel_flags.lock().remove(run_id);
        let finished = self.get(run_id);
        if let Some(run) = &finished {
            self.trace(run, "run_finished", run.error.clone());
            if let Some(metrics) = &self.metrics {
                if run.status.is_terminal() {
                    metrics
                        .record_agent_run(run.status.as_str(), started.elapsed().as_secs_f64());
                }
            }
        }
        self.prune_completed_runs();
    }

    async fn execute_steps(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<String> {
        // Resolve the run-level model up front so the record shows it.
        let resolved = self.resolve_model(&request.model)?;
        let _ = self.update_run(run_id, |run| {
            run.resolved_model = Some(resolved.clone());
        });

        match request.strategy {
            ExecutionStrategy::Handoff | ExecutionStrategy::Router => {
                self.execute_sequential(run_id, request, cancel_flag).await
            }
            ExecutionStrategy::ParallelMap => {
                self.execute_parallel(run_id, request, cancel_flag).await
            }
        }
    }

    async fn execute_sequential(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<String> {
        let step_count = self.get(run_id).map(|run| run.steps.len()).unwrap_or(0);
        let mut previous_output: Option<String> = None;

        for index in 0..step_count {
            if cancel_flag.load(Ordering::Acquire) {
                return Err(Error::Internal("Run cancelled".into()));
            }
            self.check_budget(run_id)?;

            let input = graph::step_input(
                request.strategy,
                &request.input,
                previous_output.as_deref(),
            );
            let role = {
                let runs = self.runs.lock();
                runs.get(run_id)
                    .and_then(|run| run.steps.get(index))
                    .map(|step| step.role.clone())
                    .ok_or_else(|| Error::Internal("run vanished mid-execution".into()))?
            };
            let _ = self.update_run(run_id, |run| {
                if let Some(step) = run.steps.get_mut(index) {
                    step.status = StepStatus::Running;
                    step.input = input.clone();
                    step.started_at = Some(Utc::now());
                }
            });

            match self.run_step(run_id, request, &role, &input, &cancel_flag).await {
                // A cancellation racing the backend call wins over the
                // step result: cancelled steps stay cancelled.
                Ok(_) if cancel_flag.load(Ordering::Acquire) => {
                    return Err(Error::Internal("Run cancelled".into()));
                }
                Ok(output) => {
                    let _ = self.update_run(run_id, |run| {
                        if let Some(step) = run.steps.get_mut(index) {
                            if !step.status.is_terminal() {
                                step.status = StepStatus::Completed;
                                step.output = Some(output.clone());
                                step.completed_at = Some(Utc::now());
                                run.checkpoint_pointer = Some(step.id.clone());
                            }
                        }
                    });
                    previous_output = Some(output);
                }
                Err(e) => {
                    let cancelled = cancel_flag.load(Ordering::Acquire);
                    let _ = self.update_run(run_id, |run| {
                        if let Some(step) = run.steps.get_mut(index) {
                            if !step.status.is_terminal() {
                                step.status = if cancelled {
                                    StepStatus::Cancelled
                                } else {
                                    StepStatus::Failed
                                };
                                step.error = Some(e.to_string());
                                step.completed_at = Some(Utc::now());
                            }
                        }
                    });
                    return Err(e);
                }
            }
        }

        Ok(previous_output.unwrap_or_default())
    }

    async fn execute_parallel(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<String> {
        let steps: Vec<(usize, String)> = {
            let runs = self.runs.lock();
            runs.get(run_id)
                .map(|run| {
                    run.steps
                        .iter()
                        .enumerate()
                        .map(|(i, s)| (i, s.role.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut pending = FuturesUnordered::new();
        let mut waiting = steps.into_iter();
        let mut outputs: Vec<Option<String>> = Vec::new();
        let mut first_error: Option<Error> = None;

        loop {
            // Top up to the parallelism bound; budgets are checked before
            // each step begins.
            while pending.len() < self.options.max_parallelism && first_error.is_none() {
                if cancel_flag.load(Ordering::Acquire) {
                    first_error = Some(Error::Internal("Run cancelled".into()));
                    break;
                }
                if let Err(e) = self.check_budget(run_id) {
                    first_error = Some(e);
                    break;
                }
                let Some((index, role)) = waiting.next() else {
                    break;
                };
                if outputs.len() <= index {
                    outputs.resize(index + 1, None);
                }
                let runtime = self.clone();
                let run_id = run_id.to_string();
                let request = request.clone();
                let cancel_flag = cancel_flag.clone();
                let input = request.input.clone();
                let _ = self.update_run(&run_id, |run| {
                    if let Some(step) = run.steps.get_mut(index) {
                        step.status = StepStatus::Running;
                        step.started_at = Some(Utc::now());
                    }
                });
                pending.push(async move {
                    let outcome = runtime
                        .run_step(&run_id, &request, &role, &input, &cancel_flag)
                        .await;
                    (index, outcome)
                });
            }

            let Some((index, outcome)) = pending.next().await else {
                break;
            };
            match outcome {
                Ok(_) if cancel_flag.load(Ordering::Acquire) => {
                    if first_error.is_none() {
                        first_error = Some(Error::Internal("Run cancelled".into()));
                    }
                }
                Ok(output) => {
                    let _ = self.update_run(run_id, |run| {
                        if let Some(step) = run.steps.get_mut(index) {
                            if !step.status.is_terminal() {
                                step.status = StepStatus::Completed;
                                step.output = Some(output.clone());
                                step.completed_at = Some(Utc::now());
                                run.checkpoint_pointer = Some(step.id.clone());
                            }
                        }
                    });
                    outputs[index] = Some(output);
                }
                Err(e) => {
                    let cancelled = cancel_flag.load(Ordering::Acquire);
                    let _ = self.update_run(run_id, |run| {
                        if let Some(step) = run.steps.get_mut(index) {
                            if !step.status.is_terminal() {
                                step.status = if cancelled {
                                    StepStatus::Cancelled
                                } else {
                                    StepStatus::Failed
                                };
                                step.error = Some(e.to_string());
                                step.completed_at = Some(Utc::now());
                            }
                        }
                    });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outputs
                .into_iter()
                .flatten()
                .collect::<Vec<String>>()
                .join("\n\n")),
        }
    }

    async fn run_step(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        role: &str,
        input: &str,
        cancel_flag: &Arc<AtomicBool>,
    ) -> Result<String> {
        let requested_model = request.model_for_role(role).unwrap_or(&request.model);
        let model_id = self.resolve_model(requested_model)?;
        let system_prompt = request.system_prompt_for_role(role);
        let params = SamplingParams {
            tools: request.tools_for_role(role).cloned(),
            ..Default::default()
        };
        let priority = request.priority.inference_priority();
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::user(input.to_string()),
        ];

        let attempts_total = self.options.step_retry_attempts + 1;
        let mut completion: Option<Completion> = None;
        for attempt in 0..attempts_total {
            if cancel_flag.load(Ordering::Acquire) {
                return Err(Error::Internal("Run cancelled".into()));
            }
            match self
                .engine
                .generate(
                    &model_id,
                    &messages,
                    &params,
                    priority,
                    request.submitted_by.as_deref(),
                )
                .await
            {
                Ok(result) => {
                    completion = Some(result);
                    break;
                }
                Err(e) => {
                    let last_attempt = attempt + 1 >= attempts_total;
                    if last_attempt || !e.is_transient() {
                        return Err(e);
                    }
                    let delay = self.options.step_retry_backoff * 2u32.pow(attempt as u32);
                    if let Some(run) = self.get(run_id) {
                        let mut metadata = trace_metadata(&run);
                        metadata.insert("retry_attempt".into(), (attempt + 1).to_string());
                        metadata
                            .insert("retry_delay_sec".into(), format!("{:.3}", delay.as_secs_f64()));
                        self.tracer.emit(
                            TraceEvent::new(run_id, "step_retry", run.status)
                                .with_message(e.to_string())
                                .with_metadata(metadata),
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let completion = completion
            .ok_or_else(|| Error::Internal("step produced no completion".into()))?;
        let tokens = u64::from(completion.usage.total_tokens);
        let cost = tokens as f64 / 1000.0 * self.options.cost_per_1k_tokens;
        let _ = self.update_run(run_id, |run| {
            run.tokens_used += tokens;
            run.estimated_cost_usd += cost;
        });
        Ok(completion.content.unwrap_or_default())
    }

    // ── Budgets & routing ──────────────────────────────────────────────

    /// Hard stops, checked before each step begins.
    fn check_budget(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock();
        let Some(run) = runs.get(run_id) else {
            return Ok(());
        };
        if let Some(token_budget) = run.request.token_budget {
            if run.tokens_used >= token_budget {
                return Err(Error::BudgetExhausted {
                    budget: "token",
                    used: run.tokens_used as f64,
                    limit: token_budget as f64,
                });
            }
        }
        if let Some(cost_budget) = run.request.cost_budget_usd {
            if run.estimated_cost_usd >= cost_budget {
                return Err(Error::BudgetExhausted {
                    budget: "cost",
                    used: run.estimated_cost_usd,
                    limit: cost_budget,
                });
            }
        }
        Ok(())
    }

    fn resolve_model(&self, requested: &str) -> Result<String> {
        let loaded = self.engine.loaded_model_ids();
        if loaded.is_empty() {
            return Err(Error::ModelNotFound(
                "No models are currently loaded. Load a model before submitting agent runs."
                    .into(),
            ));
        }
        let snapshot = self.engine.model_load_snapshot(&loaded);
        let resolved = self
            .router
            .read()
            .resolve(requested, &loaded, Some(&snapshot));
        if !self.engine.is_model_loaded(&resolved) {
            return Err(Error::ModelNotFound(format!(
                "Resolved model '{resolved}' is not loaded for requested model '{requested}'."
            )));
        }
        Ok(resolved)
    }

    // ── Bookkeeping ────────────────────────────────────────────────────

    fn record_run(&self, run: &AgentRun) -> Result<()> {
        self.runs.lock().insert(run.id.clone(), run.clone());
        self.state_store.upsert_run(run)?;
        Ok(())
    }

    /// Mutate a run under the lock, then persist the updated record.
    fn update_run<F: FnOnce(&mut AgentRun)>(&self, run_id: &str, f: F) -> Result<()> {
        let updated = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(run_id) else {
                return Ok(());
            };
            f(run);
            run.updated_at = Utc::now();
            run.clone()
        };
        self.state_store.upsert_run(&updated)
    }

    fn prune_completed_runs(&self) {
        let stale: Vec<String> = {
            let runs = self.runs.lock();
            let mut terminal: Vec<(&String, chrono::DateTime<Utc>)> = runs
                .values()
                .filter(|run| run.status.is_terminal())
                .map(|run| (&run.id, run.updated_at))
                .collect();
            let overflow = terminal.len().saturating_sub(self.options.retain_completed_runs);
            if overflow == 0 {
                return;
            }
            terminal.sort_by_key(|(_, updated_at)| *updated_at);
            terminal
                .into_iter()
                .take(overflow)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut runs = self.runs.lock();
        for id in stale {
            runs.remove(&id);
            if let Err(e) = self.state_store.delete_run(&id) {
                tracing::warn!(run_id = %id, error = %e, "prune failed");
            }
        }
    }

    fn trace(&self, run: &AgentRun, event: &'static str, message: Option<String>) {
        let mut trace_event =
            TraceEvent::new(&run.id, event, run.status).with_metadata(trace_metadata(run));
        if let Some(message) = message {
            trace_event = trace_event.with_message(message);
        }
        self.tracer.emit(trace_event);
    }

    fn trace_by_id(&self, run_id: &str, event: &'static str, message: Option<String>) {
        if let Some(run) = self.get(run_id) {
            self.trace(&run, event, message);
        }
    }
}

fn trace_metadata(run: &AgentRun) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("priority".into(), run.request.priority.as_str().into());
    if let Some(traceparent) = &run.request.traceparent {
        metadata.insert("traceparent".into(), traceparent.clone());
    }
    if let Some(tracestate) = &run.request.tracestate {
        metadata.insert("tracestate".into(), tracestate.clone());
    }
    if let Some(submitted_by) = &run.request.submitted_by {
        metadata.insert("submitted_by".into(), submitted_by.clone());
    }
    metadata
}

fn mark_run_cancelled(run: &mut AgentRun, reason: &str) {
    run.status = RunStatus::Cancelled;
    run.error = Some(reason.to_string());
    run.updated_at = Utc::now();
    for step in &mut run.steps {
        if !step.status.is_terminal() {
            step.status = StepStatus::Cancelled;
            step.error = Some(reason.to_string());
            step.completed_at = Some(Utc::now());
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracing_ext::RecordingTracer;
    use lmx_domain::chat::Usage;
    use lmx_domain::config::{QueueBackend, SchedulerConfig};
    use std::sync::atomic::AtomicUsize;

    /// Engine stub: echoes "<role-input> handled", 8+5 tokens per step.
    struct StubEngine {
        loaded: Vec<String>,
        calls: AtomicUsize,
        fail_first_attempts: AtomicUsize,
        block: Option<Arc<tokio::sync::Notify>>,
    }

    impl Default for StubEngine {
        fn default() -> Self {
            Self {
                loaded: vec!["main".to_string()],
                calls: AtomicUsize::new(0),
                fail_first_attempts: AtomicUsize::new(0),
                block: None,
            }
        }
    }

    #[async_trait]
    impl EngineHandle for StubEngine {
        fn loaded_model_ids(&self) -> Vec<String> {
            self.loaded.clone()
        }

        fn is_model_loaded(&self, model_id: &str) -> bool {
            self.loaded.iter().any(|m| m == model_id)
        }

        fn model_load_snapshot(&self, model_ids: &[String]) -> HashMap<String, f64> {
            model_ids.iter().map(|m| (m.clone(), 0.0)).collect()
        }

        async fn generate(
            &self,
            _model_id: &str,
            messages: &[ChatMessage],
            _params: &SamplingParams,
            _priority: Priority,
            _client_id: Option<&str>,
        ) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first_attempts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n > 0).then(|| n - 1)
                })
                .is_ok()
            {
                return Err(Error::Internal("upstream timed out".into()));
            }
            if let Some(block) = &self.block {
                block.notified().await;
            }
            let input = messages
                .iter()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(Completion {
                model: "main".into(),
                content: Some(format!("{input} handled")),
                tool_calls: Vec::new(),
                usage: Usage::new(8, 5),
                finish_reason: "stop".into(),
            })
        }
    }

    struct Fixture {
        runtime: Arc<AgentsRuntime>,
        engine: Arc<StubEngine>,
        tracer: Arc<RecordingTracer>,
    }

    fn fixture_with(engine: StubEngine, options: RuntimeOptions) -> Fixture {
        let engine = Arc::new(engine);
        let tracer = Arc::new(RecordingTracer::default());
        let scheduler = Arc::new(
            RunScheduler::new(&SchedulerConfig {
                backend: QueueBackend::Memory,
                max_queue_size: 16,
                worker_count: 1,
                persist_path: None,
            })
            .unwrap(),
        );
        let runtime = Arc::new(
            AgentsRuntime::new(
                engine.clone(),
                Arc::new(RwLock::new(TaskRouter::default())),
                tracer.clone(),
                None,
                Arc::new(AgentsStateStore::in_memory().unwrap()),
                scheduler,
                options,
            )
            .unwrap(),
        );
        runtime.start();
        Fixture {
            runtime,
            engine,
            tracer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            StubEngine::default(),
            RuntimeOptions {
                step_retry_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        )
    }

    fn request(json: serde_json::Value) -> AgentRequest {
        serde_json::from_value(json).unwrap()
    }

    async fn wait_terminal(runtime: &AgentsRuntime, run_id: &str) -> AgentRun {
        for _ in 0..200 {
            if let Some(run) = runtime.get(run_id) {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached a terminal state");
    }

    #[tokio::test]
    async fn handoff_chains_outputs() {
        let f = fixture();
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "task",
                    "roles": ["planner", "coder"],
                    "strategy": "handoff",
                })),
                None,
                "",
            )
            .await
            .unwrap();
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Completed);
        // Step 2 received "step1_output:task".
        assert_eq!(
            done.result.as_deref(),
            Some("task handled:task handled")
        );
        assert_eq!(done.tokens_used, 26);
        assert_eq!(done.resolved_model.as_deref(), Some("main"));
        assert!(done.checkpoint_pointer.is_some());
        assert!(done
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed));

        let names = f.tracer.event_names();
        assert!(names.contains(&"run_submitted"));
        assert!(names.contains(&"run_started"));
        assert!(names.contains(&"run_finished"));
    }

    #[tokio::test]
    async fn token_budget_is_a_hard_stop() {
        let f = fixture();
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "x",
                    "roles": ["a", "b", "c"],
                    "token_budget": 10,
                })),
                None,
                "",
            )
            .await
            .unwrap();
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        let error = done.error.unwrap();
        assert!(error.contains("Budget exhausted"), "{error}");
        assert!(error.contains("token"), "{error}");
        // Step A consumed 8 + 5 tokens before the check tripped.
        assert_eq!(done.tokens_used, 13);
        assert_eq!(done.steps[0].status, StepStatus::Completed);
        assert_eq!(done.steps[1].status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let engine = StubEngine {
            fail_first_attempts: AtomicUsize::new(1),
            ..Default::default()
        };
        let f = fixture_with(
            engine,
            RuntimeOptions {
                step_retry_attempts: 2,
                step_retry_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        );
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "x",
                    "roles": ["a"],
                })),
                None,
                "",
            )
            .await
            .unwrap();
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(f.engine.calls.load(Ordering::SeqCst), 2);
        assert!(f.tracer.event_names().contains(&"step_retry"));
    }

    #[tokio::test]
    async fn idempotent_submit_returns_same_run() {
        let f = fixture();
        let body = serde_json::json!({
            "model": "main",
            "input": "x",
            "roles": ["a"],
        });
        let first = f
            .runtime
            .submit(request(body.clone()), Some("K"), "A")
            .await
            .unwrap();
        let second = f
            .runtime
            .submit(request(body.clone()), Some("K"), "A")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let conflict = f
            .runtime
            .submit(request(body), Some("K"), "B")
            .await
            .unwrap_err();
        assert!(matches!(conflict, Error::Validation(_)));
        // The original run is unchanged.
        assert!(f.runtime.get(&first.id).is_some());
    }

    #[tokio::test]
    async fn cancel_marks_steps_cancelled() {
        let block = Arc::new(tokio::sync::Notify::new());
        let engine = StubEngine {
            block: Some(block.clone()),
            ..Default::default()
        };
        let f = fixture_with(engine, RuntimeOptions::default());
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "x",
                    "roles": ["a", "b"],
                })),
                None,
                "",
            )
            .await
            .unwrap();

        // Wait until the first step is running, then cancel.
        for _ in 0..100 {
            if f.runtime
                .get(&run.id)
                .map(|r| r.status == RunStatus::Running)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.runtime.cancel(&run.id).await);
        block.notify_waiters();

        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Cancelled);
        assert!(done
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Cancelled));
        // Terminal states are absorbing; a second cancel still reports
        // cancelled and nothing resurrects the run.
        assert!(f.runtime.cancel(&run.id).await);
        assert_eq!(f.runtime.get(&run.id).unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn parallel_map_runs_all_roles() {
        let f = fixture();
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "shared",
                    "roles": ["a", "b", "c"],
                    "strategy": "parallel_map",
                })),
                None,
                "",
            )
            .await
            .unwrap();
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result.matches("shared handled").count(), 3);
        assert_eq!(done.tokens_used, 39);
    }

    #[tokio::test]
    async fn router_orders_roles() {
        let f = fixture();
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "x",
                    "roles": ["reviewer", "planner"],
                    "strategy": "router",
                })),
                None,
                "",
            )
            .await
            .unwrap();
        assert_eq!(run.steps[0].role, "planner");
        assert_eq!(run.steps[1].role, "reviewer");
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn no_loaded_models_fails_run() {
        let engine = StubEngine {
            loaded: Vec::new(),
            ..Default::default()
        };
        let f = fixture_with(engine, RuntimeOptions::default());
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "input": "x",
                    "roles": ["a"],
                })),
                None,
                "",
            )
            .await
            .unwrap();
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.unwrap().contains("No models are currently loaded"));
    }

    #[tokio::test]
    async fn approval_gate_holds_run() {
        let f = fixture();
        let run = f
            .runtime
            .submit(
                request(serde_json::json!({
                    "model": "main",
                    "input": "x",
                    "roles": ["a"],
                    "approval_required": true,
                })),
                None,
                "",
            )
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::WaitingApproval);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.runtime.get(&run.id).unwrap().status,
            RunStatus::WaitingApproval
        );

        f.runtime.approve(&run.id).await.unwrap();
        let done = wait_terminal(&f.runtime, &run.id).await;
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn restart_interrupted_runs_marked_failed() {
        let store = Arc::new(AgentsStateStore::in_memory().unwrap());
        let mut run = AgentRun::new(
            request(serde_json::json!({"input": "x", "roles": ["a"]})),
            RunStatus::Running,
        );
        run.checkpoint_pointer = Some("step-7".into());
        store.upsert_run(&run).unwrap();

        let scheduler = Arc::new(
            RunScheduler::new(&SchedulerConfig {
                backend: QueueBackend::Memory,
                max_queue_size: 4,
                worker_count: 1,
                persist_path: None,
            })
            .unwrap(),
        );
        let runtime = AgentsRuntime::new(
            Arc::new(StubEngine::default()),
            Arc::new(RwLock::new(TaskRouter::default())),
            Arc::new(RecordingTracer::default()),
            None,
            store.clone(),
            scheduler,
            RuntimeOptions::default(),
        )
        .unwrap();

        let restored = runtime.get(&run.id).unwrap();
        assert_eq!(restored.status, RunStatus::Failed);
        assert!(restored.error.unwrap().contains("interrupted"));
        assert_eq!(restored.checkpoint_pointer.as_deref(), Some("step-7"));
        // The rewrite was persisted too.
        assert_eq!(
            store.get_run(&run.id).unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn retention_prunes_oldest_terminal_runs() {
        let f = fixture_with(
            StubEngine::default(),
            RuntimeOptions {
                retain_completed_runs: 1,
                ..Default::default()
            },
        );
        let first = f
            .runtime
            .submit(
                request(serde_json::json!({"model": "main", "input": "x", "roles": ["a"]})),
                None,
                "",
            )
            .await
            .unwrap();
        wait_terminal(&f.runtime, &first.id).await;
        let second = f
            .runtime
            .submit(
                request(serde_json::json!({"model": "main", "input": "y", "roles": ["a"]})),
                None,
                "",
            )
            .await
            .unwrap();
        wait_terminal(&f.runtime, &second.id).await;

        // Only the newest terminal run is retained.
        assert!(f.runtime.get(&second.id).is_some());
        assert!(f.runtime.get(&first.id).is_none());
    }
}
