//! Skill execution: prompt rendering and native entrypoint invocation.
//!
//! Entrypoints are `module:function` references resolved against a
//! registry of handlers registered at startup — skills never load
//! arbitrary code. Execution is gated (policy → sandbox → schema), runs
//! under a bounded semaphore, and is cut off by a hard timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;

use lmx_domain::config::SkillsConfig;
use lmx_domain::Result;

use crate::manifest::{validate_skill_arguments, SkillKind, SkillManifest};
use crate::policy::SkillsPolicy;

pub type Arguments = serde_json::Map<String, serde_json::Value>;
pub type EntrypointFn =
    Arc<dyn Fn(Arguments) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entrypoint registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct EntrypointRegistry {
    handlers: RwLock<HashMap<String, EntrypointFn>>,
}

impl EntrypointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its `module:function` reference.
    pub fn register<F, Fut>(&self, reference: &str, handler: F)
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let boxed: EntrypointFn = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.write().insert(reference.to_string(), boxed);
    }

    pub fn get(&self, reference: &str) -> Option<EntrypointFn> {
        self.handlers.read().get(reference).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SkillExecutionResult {
    pub skill_name: String,
    pub kind: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub denied: bool,
    pub requires_approval: bool,
}

impl SkillExecutionResult {
    fn base(manifest: &SkillManifest, started: Instant) -> Self {
        Self {
            skill_name: manifest.name.clone(),
            kind: manifest.kind.as_str().to_string(),
            ok: false,
            output: None,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            denied: false,
            requires_approval: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SkillExecutor {
    policy: SkillsPolicy,
    entrypoints: Arc<EntrypointRegistry>,
    semaphore: Arc<Semaphore>,
    default_timeout: Duration,
}

impl SkillExecutor {
    pub fn new(
        policy: SkillsPolicy,
        entrypoints: Arc<EntrypointRegistry>,
        max_concurrent_calls: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            entrypoints,
            semaphore: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            default_timeout,
        }
    }

    pub fn from_config(
        config: &SkillsConfig,
        policy: SkillsPolicy,
        entrypoints: Arc<EntrypointRegistry>,
    ) -> Self {
        Self::new(
            policy,
            entrypoints,
            config.max_concurrent_calls,
            Duration::from_secs_f64(config.default_timeout_sec),
        )
    }

    /// Execute one skill. All failure modes are reported through the
    /// result record, never as an Err.
    pub async fn execute(
        &self,
        manifest: &SkillManifest,
        arguments: Arguments,
        approved: bool,
        timeout_override: Option<Duration>,
    ) -> SkillExecutionResult {
        let started = Instant::now();
        let mut result = SkillExecutionResult::base(manifest, started);

        // 1. Policy (tags + sandbox).
        let decision = self.policy.evaluate(manifest, approved);
        result.requires_approval = decision.requires_approval;
        if !decision.allowed {
            result.denied = !decision.requires_approval;
            result.error = decision.reason;
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        // 2. Argument schema.
        if let Some(validation_error) = validate_skill_arguments(&arguments, &manifest.input_schema)
        {
            result.error = Some(validation_error);
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        // 3. Timeout resolution.
        let mut timeout = timeout_override
            .unwrap_or_else(|| Duration::from_secs_f64(manifest.timeout_sec));
        if timeout.is_zero() {
            timeout = self.default_timeout;
        }

        // 4. Bounded execution.
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                result.error = Some("executor shut down".to_string());
                return result;
            }
        };

        let outcome = match manifest.kind {
            SkillKind::Prompt => Ok(render_prompt(manifest, &arguments)),
            SkillKind::Entrypoint => {
                let reference = manifest.entrypoint.as_deref().unwrap_or("");
                match self.entrypoints.get(reference) {
                    Some(handler) => {
                        match tokio::time::timeout(timeout, handler(arguments)).await {
                            Ok(Ok(output)) => Ok(output),
                            Ok(Err(e)) => Err((e.to_string(), false)),
                            Err(_) => Err((
                                format!("skill timed out after {:.1}s", timeout.as_secs_f64()),
                                true,
                            )),
                        }
                    }
                    None => Err((format!("entrypoint '{reference}' is not registered"), false)),
                }
            }
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                result.ok = true;
                result.output = Some(output);
            }
            Err((message, timed_out)) => {
                result.error = Some(message);
                result.timed_out = timed_out;
            }
        }
        result
    }
}

/// Render a prompt template: `{name}` placeholders are replaced with
/// argument values (strings verbatim, everything else as JSON).
fn render_prompt(manifest: &SkillManifest, arguments: &Arguments) -> serde_json::Value {
    let template = manifest.prompt_template.as_deref().unwrap_or("");
    let mut rendered = template.to_string();
    for (key, value) in arguments {
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{key}}}"), &replacement);
    }
    serde_json::Value::String(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmx_domain::config::SandboxProfile;
    use lmx_domain::Error;

    fn executor() -> SkillExecutor {
        executor_with(SkillsPolicy::default())
    }

    fn executor_with(policy: SkillsPolicy) -> SkillExecutor {
        let entrypoints = Arc::new(EntrypointRegistry::new());
        entrypoints.register("tools.math:add", |args: Arguments| async move {
            let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!(a + b))
        });
        entrypoints.register("tools.slow:sleep", |_args: Arguments| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::json!("done"))
        });
        entrypoints.register("tools.bad:boom", |_args: Arguments| async move {
            Err(Error::Internal("boom".into()))
        });
        SkillExecutor::new(policy, entrypoints, 4, Duration::from_secs(2))
    }

    fn prompt_manifest() -> SkillManifest {
        serde_json::from_value(serde_json::json!({
            "name": "summarize",
            "description": "summarize",
            "kind": "prompt",
            "prompt_template": "Summarize {text} in {words} words",
        }))
        .unwrap()
    }

    fn entrypoint_manifest(reference: &str) -> SkillManifest {
        serde_json::from_value(serde_json::json!({
            "name": "math",
            "description": "math",
            "kind": "entrypoint",
            "entrypoint": reference,
            "timeout_sec": 0.2,
        }))
        .unwrap()
    }

    fn args(json: serde_json::Value) -> Arguments {
        json.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn prompt_renders_placeholders() {
        let result = executor()
            .execute(
                &prompt_manifest(),
                args(serde_json::json!({"text": "the doc", "words": 5})),
                false,
                None,
            )
            .await;
        assert!(result.ok, "{result:?}");
        assert_eq!(
            result.output,
            Some(serde_json::json!("Summarize the doc in 5 words"))
        );
        assert_eq!(result.kind, "prompt");
    }

    #[tokio::test]
    async fn entrypoint_invokes_handler() {
        let result = executor()
            .execute(
                &entrypoint_manifest("tools.math:add"),
                args(serde_json::json!({"a": 2, "b": 3})),
                false,
                None,
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.output, Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn unregistered_entrypoint_fails_cleanly() {
        let result = executor()
            .execute(
                &entrypoint_manifest("tools.ghost:run"),
                Arguments::new(),
                false,
                None,
            )
            .await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn handler_error_captured() {
        let result = executor()
            .execute(
                &entrypoint_manifest("tools.bad:boom"),
                Arguments::new(),
                false,
                None,
            )
            .await;
        assert!(!result.ok);
        assert!(!result.timed_out);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn hard_timeout_sets_flag() {
        let result = executor()
            .execute(
                &entrypoint_manifest("tools.slow:sleep"),
                Arguments::new(),
                false,
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(!result.ok);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn approval_gate_reported() {
        let mut manifest = prompt_manifest();
        manifest.risk_tags = vec![crate::manifest::RiskTag::ApprovalRequired];
        let result = executor()
            .execute(&manifest, args(serde_json::json!({"text": "x"})), false, None)
            .await;
        assert!(!result.ok);
        assert!(result.requires_approval);
        assert!(!result.denied);

        let result = executor()
            .execute(&manifest, args(serde_json::json!({"text": "x"})), true, None)
            .await;
        assert!(result.ok);
    }

    #[tokio::test]
    async fn sandbox_denial_reported() {
        let policy = SkillsPolicy::new(SandboxProfile::Strict, Vec::new());
        let result = executor_with(policy)
            .execute(
                &entrypoint_manifest("tools.math:add"),
                Arguments::new(),
                false,
                None,
            )
            .await;
        assert!(!result.ok);
        assert!(result.denied);
    }

    #[tokio::test]
    async fn schema_violation_reported() {
        let mut manifest = prompt_manifest();
        manifest.input_schema = serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        });
        let result = executor()
            .execute(&manifest, Arguments::new(), false, None)
            .await;
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("arguments.text is required"));
    }
}
