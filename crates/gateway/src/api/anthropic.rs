//! Anthropic Messages shim — translates `/v1/messages` to the internal
//! chat pipeline.
//!
//! Streaming emits the named-event sequence Anthropic clients expect:
//! `message_start`, `content_block_start`, `content_block_delta`,
//! `content_block_stop`, `message_delta`, `message_stop`.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use lmx_domain::chat::{ChatMessage, Priority, SamplingParams, Usage};
use lmx_domain::stream::StreamChunk;

use crate::api::chat::resolve_chat_model;
use crate::api::error::{error_body, ApiError};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Anthropic message content: plain string or typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    fn flatten(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .filter_map(|b| b.text.clone())
                .collect::<Vec<String>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

impl MessagesRequest {
    fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        for message in &self.messages {
            messages.push(ChatMessage::new(
                message.role.clone(),
                message.content.flatten(),
            ));
        }
        messages
    }

    fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: Some(self.max_tokens),
            stop: self.stop_sequences.clone(),
            ..Default::default()
        }
    }
}

fn message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn messages(State(state): State<AppState>, Json(body): Json<MessagesRequest>) -> Response {
    let mut params = body.sampling_params();
    let mut chat_messages = body.chat_messages();
    let model_id = match resolve_chat_model(&state, &body.model, &mut params, &mut chat_messages) {
        Ok(model_id) => model_id,
        Err(e) => return e.into_response(),
    };

    if !body.stream {
        return match state
            .engine
            .generate(&model_id, &chat_messages, &params, Priority::Normal, None)
            .await
        {
            Ok(completion) => Json(serde_json::json!({
                "id": message_id(),
                "type": "message",
                "role": "assistant",
                "model": completion.model,
                "content": [{"type": "text", "text": completion.content.unwrap_or_default()}],
                "stop_reason": "end_turn",
                "usage": {
                    "input_tokens": completion.usage.prompt_tokens,
                    "output_tokens": completion.usage.completion_tokens,
                },
            }))
            .into_response(),
            Err(e) => ApiError(e).into_response(),
        };
    }

    let chunk_stream = match state
        .engine
        .stream_generate(&model_id, &chat_messages, &params, Priority::Normal, None)
        .await
    {
        Ok(stream) => stream,
        Err(e) => return ApiError(e).into_response(),
    };

    let id = message_id();
    let model = model_id.clone();
    let sse_stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(
            Event::default().event("message_start").data(
                serde_json::json!({
                    "type": "message_start",
                    "message": {
                        "id": id,
                        "type": "message",
                        "role": "assistant",
                        "model": model,
                        "content": [],
                    }
                })
                .to_string(),
            ),
        );
        yield Ok(Event::default().event("content_block_start").data(
            serde_json::json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            })
            .to_string(),
        ));

        let mut chunk_stream = chunk_stream;
        let mut usage = Usage::default();
        while let Some(item) = chunk_stream.next().await {
            match item {
                Ok(StreamChunk::Token(text)) => {
                    yield Ok(Event::default().event("content_block_delta").data(
                        serde_json::json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": {"type": "text_delta", "text": text},
                        })
                        .to_string(),
                    ));
                }
                Ok(StreamChunk::End { usage: final_usage }) => usage = final_usage,
                Ok(StreamChunk::ToolCall(_)) => {}
                Err(e) => {
                    yield Ok(Event::default()
                        .event("error")
                        .data(error_body(&e).to_string()));
                    return;
                }
            }
        }

        yield Ok(Event::default().event("content_block_stop").data(
            serde_json::json!({"type": "content_block_stop", "index": 0}).to_string(),
        ));
        yield Ok(Event::default().event("message_delta").data(
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": usage.completion_tokens},
            })
            .to_string(),
        ));
        yield Ok(Event::default()
            .event("message_stop")
            .data(serde_json::json!({"type": "message_stop"}).to_string()));
    };

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
