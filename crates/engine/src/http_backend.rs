//! HTTP backends — local runtime processes speaking the OpenAI wire
//! format (one endpoint per backend kind).
//!
//! The tensor runtime itself lives outside this process; we talk to it
//! over loopback HTTP. Streaming uses SSE: chunks are buffered, split on
//! `\n\n`, and each `data:` payload is parsed into a token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use lmx_domain::chat::{ChatMessage, SamplingParams, Usage};
use lmx_domain::config::BackendEndpointConfig;
use lmx_domain::{Error, Result};

use crate::backend::{
    Backend, BackendCompletion, BackendFactory, BackendKind, BackendToken, BackendTokenStream,
    PerformanceProfile,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire types (responses only; requests are built as raw JSON)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    choices: Vec<WireChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct WireChunkDelta {
    #[serde(default)]
    content: Option<String>,
    /// Speculative telemetry flag some runtimes attach per token.
    #[serde(default)]
    from_draft: Option<bool>,
}

// ── SSE buffer helper ───────────────────────────────────────────────

/// Extract complete `data:` payloads from an SSE buffer. The buffer is
/// drained in place; a trailing partial event stays for the next call.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

/// Parse one SSE `data:` payload into a token. `None` for `[DONE]` and
/// empty deltas.
fn parse_chunk_token(data: &str) -> Result<Option<BackendToken>> {
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: WireChunk = serde_json::from_str(data)
        .map_err(|e| Error::Internal(format!("backend stream chunk: {e}")))?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };
    match choice.delta.content {
        Some(text) if !text.is_empty() => Ok(Some(BackendToken {
            text,
            from_draft: choice.delta.from_draft,
        })),
        _ => Ok(None),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HttpBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct HttpBackend {
    model_id: String,
    kind: BackendKind,
    version: String,
    base_url: String,
    api_key: Option<String>,
    context_length: u32,
    speculative_forwarded: bool,
    memory_estimate_bytes: u64,
    profile: PerformanceProfile,
    http: reqwest::Client,
}

impl HttpBackend {
    fn request_body(&self, messages: &[ChatMessage], params: &SamplingParams, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model_id,
            "messages": messages,
            "stream": stream,
        });
        let object = body.as_object_mut().expect("literal object");
        if let Some(t) = params.temperature {
            object.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(p) = params.top_p {
            object.insert("top_p".into(), serde_json::json!(p));
        }
        if let Some(m) = params.max_tokens {
            object.insert("max_tokens".into(), serde_json::json!(m));
        }
        if let Some(stop) = &params.stop {
            object.insert("stop".into(), serde_json::json!(stop));
        }
        if let Some(format) = &params.response_format {
            object.insert("response_format".into(), format.clone());
        }
        if let Some(f) = params.frequency_penalty {
            object.insert("frequency_penalty".into(), serde_json::json!(f));
        }
        if let Some(p) = params.presence_penalty {
            object.insert("presence_penalty".into(), serde_json::json!(p));
        }
        if self.speculative_forwarded {
            if let Some(spec) = &self.profile.speculative {
                object.insert(
                    "speculative".into(),
                    serde_json::json!({
                        "draft_model": spec.draft_model,
                        "num_tokens": spec.num_tokens,
                    }),
                );
            }
        }
        if stream {
            object.insert(
                "stream_options".into(),
                serde_json::json!({"include_usage": true}),
            );
        }
        body
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<BackendCompletion> {
        let body = self.request_body(messages, params, false);
        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| backend_transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "backend {status}: {}",
                truncate(&detail, 400)
            )));
        }
        let wire: WireCompletion = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("backend response: {e}")))?;
        let text = wire
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        let usage = wire.usage.unwrap_or_default();
        Ok(BackendCompletion {
            text,
            usage: Usage::new(usage.prompt_tokens, usage.completion_tokens),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<BackendTokenStream> {
        let body = self.request_body(messages, params, true);
        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| backend_transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "backend {status}: {}",
                truncate(&detail, 400)
            )));
        }

        let stream = async_stream::stream! {
            let mut response = response;
            let mut buffer = String::new();
            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for data in drain_data_lines(&mut buffer) {
                            match parse_chunk_token(&data) {
                                Ok(Some(token)) => yield Ok(token),
                                Ok(None) => {}
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Internal(format!("backend stream: {e}")));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn context_length(&self) -> u32 {
        self.context_length
    }

    fn speculative_supported(&self) -> bool {
        self.speculative_forwarded
    }

    fn estimated_memory_bytes(&self) -> u64 {
        self.memory_estimate_bytes
    }

    async fn close(&self) {
        // Connection pool is released on drop.
    }
}

fn backend_transport_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Internal("backend request timed out".into())
    } else {
        Error::Internal(format!("backend transport: {e}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpBackendFactory {
    endpoints: HashMap<BackendKind, BackendEndpointConfig>,
    http: reqwest::Client,
}

impl HttpBackendFactory {
    pub fn from_config(
        backends: &HashMap<String, BackendEndpointConfig>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for (name, endpoint) in backends {
            let Some(kind) = BackendKind::parse(name) else {
                return Err(Error::Validation(format!(
                    "models.backends: unknown backend kind '{name}'"
                )));
            };
            endpoints.insert(kind, endpoint.clone());
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("backend http client: {e}")))?;
        Ok(Self { endpoints, http })
    }

    fn endpoint(&self, kind: BackendKind) -> Result<&BackendEndpointConfig> {
        self.endpoints.get(&kind).ok_or_else(|| {
            Error::ModelRuntimeIncompatible(format!("no endpoint configured for backend {kind}"))
        })
    }

    fn version_for(kind: BackendKind) -> String {
        match kind {
            BackendKind::Mlx => "http/mlx".to_string(),
            BackendKind::Gguf => "http/gguf".to_string(),
        }
    }
}

#[async_trait]
impl BackendFactory for HttpBackendFactory {
    async fn probe(&self, model_id: &str, kind: BackendKind) -> Result<()> {
        let endpoint = self.endpoint(kind)?;
        let url = format!("{}/v1/models", endpoint.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ModelLoaderCrashed(format!("probe {kind}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ModelLoaderCrashed(format!(
                "probe {kind} for {model_id}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn create(
        &self,
        model_id: &str,
        kind: BackendKind,
        profile: &PerformanceProfile,
    ) -> Result<Arc<dyn Backend>> {
        let endpoint = self.endpoint(kind)?;
        // Only the primary runtime forwards speculative kwargs; the GGUF
        // path silently runs without them.
        let speculative_forwarded =
            kind == BackendKind::Mlx && profile.speculative.is_some();
        let context_length = profile
            .extra
            .get("context_length")
            .and_then(|v| v.as_u64())
            .unwrap_or(8192) as u32;
        let memory_estimate_bytes = profile
            .memory_estimate_gb
            .map(|gb| (gb * 1e9) as u64)
            .unwrap_or(0);

        Ok(Arc::new(HttpBackend {
            model_id: model_id.to_string(),
            kind,
            version: Self::version_for(kind),
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone(),
            context_length,
            speculative_forwarded,
            memory_estimate_bytes,
            profile: profile.clone(),
            http: self.http.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_splits_events() {
        let mut buffer = String::from("data: a\n\ndata: b\n\ndata: part");
        assert_eq!(drain_data_lines(&mut buffer), vec!["a", "b"]);
        assert_eq!(buffer, "data: part");
    }

    #[test]
    fn parse_done_sentinel() {
        assert!(parse_chunk_token("[DONE]").unwrap().is_none());
    }

    #[test]
    fn parse_content_delta() {
        let token = parse_chunk_token(
            r#"{"choices":[{"delta":{"content":"hi","from_draft":true}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(token.text, "hi");
        assert_eq!(token.from_draft, Some(true));
    }

    #[test]
    fn parse_empty_delta_skipped() {
        assert!(parse_chunk_token(r#"{"choices":[{"delta":{}}]}"#)
            .unwrap()
            .is_none());
        assert!(parse_chunk_token(r#"{"choices":[]}"#).unwrap().is_none());
    }

    #[test]
    fn parse_garbage_is_error() {
        assert!(parse_chunk_token("not json").is_err());
    }

    #[test]
    fn factory_rejects_unknown_kind() {
        let mut backends = HashMap::new();
        backends.insert(
            "cuda".to_string(),
            BackendEndpointConfig {
                base_url: "http://127.0.0.1:8000".into(),
                api_key: None,
            },
        );
        assert!(HttpBackendFactory::from_config(&backends, Duration::from_secs(30)).is_err());
    }

    #[tokio::test]
    async fn factory_requires_configured_endpoint() {
        let factory =
            HttpBackendFactory::from_config(&HashMap::new(), Duration::from_secs(30)).unwrap();
        let err = factory
            .create("m", BackendKind::Mlx, &PerformanceProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelRuntimeIncompatible(_)));
    }

    #[tokio::test]
    async fn created_backend_reflects_profile() {
        let mut backends = HashMap::new();
        backends.insert(
            "mlx".to_string(),
            BackendEndpointConfig {
                base_url: "http://127.0.0.1:8080".into(),
                api_key: None,
            },
        );
        let factory =
            HttpBackendFactory::from_config(&backends, Duration::from_secs(30)).unwrap();
        let profile = PerformanceProfile {
            speculative: Some(crate::backend::SpeculativeSpec {
                draft_model: Some("draft".into()),
                num_tokens: 4,
                require_supported: false,
            }),
            memory_estimate_gb: Some(2.0),
            ..Default::default()
        };
        let backend = factory
            .create("m", BackendKind::Mlx, &profile)
            .await
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Mlx);
        assert!(backend.speculative_supported());
        assert_eq!(backend.estimated_memory_bytes(), 2_000_000_000);
        assert_eq!(backend.context_length(), 8192);
    }
}
