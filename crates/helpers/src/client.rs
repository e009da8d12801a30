//! Async HTTP client for remote helper nodes (embedding / reranking).
//!
//! Every call runs through the node's circuit breaker and a bounded retry
//! policy (429, 5xx, timeouts, and connection errors are retryable). On
//! final failure the error carries the node's configured fallback tag so
//! the caller knows whether to fall back locally or fail the request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lmx_domain::config::{HelperFallback, HelperNodeConfig};
use lmx_domain::{Error, Result};

use crate::breaker::CircuitBreaker;

/// One reranked document reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedDocument {
    pub index: usize,
    pub score: f64,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RankedDocument>,
}

pub struct HelperNodeClient {
    config: HelperNodeConfig,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl HelperNodeClient {
    pub fn new(config: HelperNodeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_sec))
            .build()
            .map_err(|e| Error::Internal(format!("helper http client: {e}")))?;
        let breaker = CircuitBreaker::new(
            config.id.clone(),
            config.failure_threshold,
            Duration::from_secs_f64(config.reset_timeout_sec),
        );
        Ok(Self {
            config,
            http,
            breaker,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    pub fn fallback(&self) -> HelperFallback {
        self.config.fallback
    }

    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state().as_str()
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::to_value(EmbedRequest { texts })?;
        let response: EmbedResponse = self.call("/embed", body).await?;
        Ok(response.vectors)
    }

    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RankedDocument>> {
        let body = serde_json::to_value(RerankRequest {
            query,
            documents,
            top_n,
        })?;
        let response: RerankResponse = self.call("/rerank", body).await?;
        Ok(response.results)
    }

    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.config.base_url.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn close(&self) {
        // reqwest clients release their pool on drop; nothing to tear down.
    }

    /// Breaker-guarded POST with retry.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        self.breaker.check().map_err(|_| self.error("circuit open"))?;

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let attempts_total = self.config.max_retries as usize + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts_total {
            if attempt > 0 {
                let delay = Duration::from_millis(250 * (1u64 << (attempt - 1)));
                tokio::time::sleep(delay).await;
            }
            match self.http.post(&url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.json::<T>().await {
                            Ok(parsed) => {
                                self.breaker.record_success();
                                return Ok(parsed);
                            }
                            Err(e) => {
                                // A malformed body will not improve on retry.
                                self.breaker.record_failure();
                                return Err(self.error(&format!("invalid response: {e}")));
                            }
                        }
                    }
                    last_error = format!("HTTP {status}");
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable {
                        self.breaker.record_failure();
                        return Err(self.error(&last_error));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !(e.is_timeout() || e.is_connect() || e.is_request()) {
                        self.breaker.record_failure();
                        return Err(self.error(&last_error));
                    }
                }
            }
            tracing::warn!(
                node = %self.config.id,
                attempt = attempt + 1,
                error = %last_error,
                "helper node call failed, retrying"
            );
        }

        self.breaker.record_failure();
        Err(self.error(&format!(
            "failed after {attempts_total} attempts: {last_error}"
        )))
    }

    fn error(&self, message: &str) -> Error {
        Error::HelperNode {
            node: self.config.id.clone(),
            message: message.to_string(),
            fallback: self.config.fallback,
        }
    }
}

/// All configured helper nodes, keyed by id.
#[derive(Default)]
pub struct HelperNodeRegistry {
    nodes: Vec<Arc<HelperNodeClient>>,
}

impl HelperNodeRegistry {
    pub fn from_config(configs: &[HelperNodeConfig]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(configs.len());
        for config in configs {
            nodes.push(Arc::new(HelperNodeClient::new(config.clone())?));
        }
        Ok(Self { nodes })
    }

    pub fn get(&self, id: &str) -> Option<Arc<HelperNodeClient>> {
        self.nodes.iter().find(|n| n.id() == id).cloned()
    }

    /// First node of the given kind, if any.
    pub fn first_of_kind(&self, kind: &str) -> Option<Arc<HelperNodeClient>> {
        self.nodes.iter().find(|n| n.kind() == kind).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<HelperNodeClient>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
