//! Provider-agnostic chat types shared by the engine, agents, and the
//! HTTP surface.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Request priority. `High` traffic may use the reserved privileged lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Sampling parameters, passed through to the backend verbatim.
///
/// Tool definitions and `response_format` stay as raw JSON — their shape
/// belongs to the OpenAI wire format, not to us.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SamplingParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    /// Per-request context budget, clamped to the model context length.
    #[serde(default)]
    pub num_ctx: Option<u32>,
}

impl SamplingParams {
    /// Range checks per the public API contract.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::Validation(format!(
                    "temperature must be in [0, 2], got {t}"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Validation(format!(
                    "top_p must be in [0, 1], got {p}"
                )));
            }
        }
        if let Some(m) = self.max_tokens {
            if m == 0 {
                return Err(Error::Validation("max_tokens must be >= 1".into()));
            }
        }
        Ok(())
    }
}

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A fully-parsed tool call in OpenAI shape (arguments as a JSON string).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Result of a non-streaming generation after tool-call extraction.
#[derive(Debug, Clone)]
pub struct Completion {
    pub model: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_ranges() {
        let mut params = SamplingParams::default();
        assert!(params.validate().is_ok());

        params.temperature = Some(2.0);
        params.top_p = Some(0.0);
        assert!(params.validate().is_ok());

        params.temperature = Some(2.1);
        assert!(params.validate().is_err());

        params.temperature = Some(1.0);
        params.top_p = Some(1.5);
        assert!(params.validate().is_err());

        params.top_p = Some(0.9);
        params.max_tokens = Some(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn usage_totals() {
        let usage = Usage::new(8, 5);
        assert_eq!(usage.total_tokens, 13);
    }

    #[test]
    fn priority_serde() {
        assert_eq!(
            serde_json::from_str::<Priority>("\"high\"").unwrap(),
            Priority::High
        );
        assert_eq!(serde_json::to_string(&Priority::Normal).unwrap(), "\"normal\"");
    }
}
