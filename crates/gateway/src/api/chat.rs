//! OpenAI-compatible chat surface: `/v1/chat/completions` (streaming and
//! non-streaming), `/v1/completions` (501), `/v1/responses`, and the
//! model listing.
//!
//! Streaming frames the engine's chunk stream as
//! `chat.completion.chunk` SSE events: one initial role chunk, content /
//! tool-call deltas in backend order, a finish chunk, an optional usage
//! chunk (`stream_options.include_usage`), and exactly one `[DONE]`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lmx_domain::chat::{ChatMessage, Priority, SamplingParams, Usage};
use lmx_domain::stream::{StreamChunk, ToolCallDelta};
use lmx_domain::Error;

use crate::api::error::{error_body, ApiError, ApiResult};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OpenAI `stop` accepts a bare string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(stop) => vec![stop],
            StopSequences::Many(stops) => stops,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub num_ctx: Option<u32>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub logprobs: Option<bool>,
    #[serde(default)]
    pub top_logprobs: Option<u32>,
    #[serde(default)]
    pub user: Option<String>,
}

impl ChatCompletionRequest {
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stop: self.stop.clone().map(StopSequences::into_vec),
            tools: self.tools.clone(),
            response_format: self.response_format.clone(),
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            num_ctx: self.num_ctx,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: WireToolFunction,
}

#[derive(Debug, Serialize)]
pub struct WireToolFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatChoice>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct ChatChoice {
    index: u32,
    message: AssistantMessage,
    finish_reason: String,
}

#[derive(Debug, Serialize)]
struct AssistantMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize)]
struct ChatChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

#[derive(Debug, Serialize, Default)]
struct ChunkChoice {
    index: u32,
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Default)]
struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<serde_json::Value>>,
}

fn wire_tool_call_delta(delta: &ToolCallDelta) -> serde_json::Value {
    serde_json::json!({
        "index": delta.index,
        "id": delta.id,
        "type": "function",
        "function": {
            "name": delta.name,
            "arguments": delta.arguments,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Preset → alias → loaded-model resolution shared by the chat, shim,
/// and WebSocket surfaces. May prepend a preset system prompt and fill
/// sampling defaults.
pub fn resolve_chat_model(
    state: &AppState,
    requested: &str,
    params: &mut SamplingParams,
    messages: &mut Vec<ChatMessage>,
) -> ApiResult<String> {
    let preset_model = state.presets.apply(requested, params, messages)?;
    let effective = preset_model.unwrap_or_else(|| requested.to_string());

    let loaded = state.engine.loaded_ids();
    let snapshot = state.engine.model_load_snapshot(&loaded);
    let resolved = state
        .router
        .read()
        .resolve(&effective, &loaded, Some(&snapshot));
    if !state.engine.is_loaded(&resolved) {
        return Err(Error::ModelNotFound(effective).into());
    }
    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat/completions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    if body.stream {
        chat_completions_stream(state, body).await
    } else {
        match chat_completions_blocking(state, body).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
}

async fn chat_completions_blocking(
    state: AppState,
    body: ChatCompletionRequest,
) -> ApiResult<Response> {
    let mut params = body.sampling_params();
    let mut messages = body.messages.clone();
    let model_id = resolve_chat_model(&state, &body.model, &mut params, &mut messages)?;
    let priority = body.priority.unwrap_or_default();

    let completion = state
        .engine
        .generate(&model_id, &messages, &params, priority, body.user.as_deref())
        .await?;

    let tool_calls: Vec<WireToolCall> = completion
        .tool_calls
        .iter()
        .map(|call| WireToolCall {
            id: call.id.clone(),
            call_type: "function",
            function: WireToolFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        })
        .collect();

    let response = ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: completion.model,
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content: completion.content,
                tool_calls,
            },
            finish_reason: completion.finish_reason,
        }],
        usage: completion.usage,
    };
    Ok(Json(response).into_response())
}

async fn chat_completions_stream(state: AppState, body: ChatCompletionRequest) -> Response {
    let include_usage = body
        .stream_options
        .as_ref()
        .map(|o| o.include_usage)
        .unwrap_or(false);
    let mut params = body.sampling_params();
    let mut messages = body.messages.clone();

    let model_id = match resolve_chat_model(&state, &body.model, &mut params, &mut messages) {
        Ok(model_id) => model_id,
        Err(e) => return e.into_response(),
    };
    let priority = body.priority.unwrap_or_default();

    let chunk_stream = match state
        .engine
        .stream_generate(&model_id, &messages, &params, priority, body.user.as_deref())
        .await
    {
        Ok(stream) => stream,
        Err(e) => return ApiError(e).into_response(),
    };

    let id = completion_id();
    let created = chrono::Utc::now().timestamp();
    let model = model_id.clone();

    let sse_stream = async_stream::stream! {
        let make_chunk = |delta: ChunkDelta, finish: Option<String>, usage: Option<Usage>| {
            ChatChunk {
                id: id.clone(),
                object: "chat.completion.chunk",
                created,
                model: model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta,
                    finish_reason: finish,
                }],
                usage,
            }
        };

        // Initial chunk announcing the assistant role.
        if let Ok(data) = serde_json::to_string(&make_chunk(
            ChunkDelta { role: Some("assistant"), ..Default::default() },
            None,
            None,
        )) {
            yield Ok::<_, std::convert::Infallible>(Event::default().data(data));
        }

        let mut chunk_stream = chunk_stream;
        let mut saw_tool_calls = false;
        let mut final_usage = None;
        while let Some(item) = chunk_stream.next().await {
            match item {
                Ok(StreamChunk::Token(text)) => {
                    let chunk = make_chunk(
                        ChunkDelta { content: Some(text), ..Default::default() },
                        None,
                        None,
                    );
                    if let Ok(data) = serde_json::to_string(&chunk) {
                        yield Ok(Event::default().data(data));
                    }
                }
                Ok(StreamChunk::ToolCall(delta)) => {
                    saw_tool_calls = true;
                    let chunk = make_chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![wire_tool_call_delta(&delta)]),
                            ..Default::default()
                        },
                        None,
                        None,
                    );
                    if let Ok(data) = serde_json::to_string(&chunk) {
                        yield Ok(Event::default().data(data));
                    }
                }
                Ok(StreamChunk::End { usage }) => {
                    final_usage = Some(usage);
                }
                Err(e) => {
                    // In-band error event, then close.
                    yield Ok(Event::default().data(error_body(&e).to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
            }
        }

        let finish_reason = if saw_tool_calls { "tool_calls" } else { "stop" };
        if let Ok(data) = serde_json::to_string(&make_chunk(
            ChunkDelta::default(),
            Some(finish_reason.to_string()),
            None,
        )) {
            yield Ok(Event::default().data(data));
        }

        if include_usage {
            let usage = final_usage.unwrap_or_default();
            let usage_chunk = ChatChunk {
                id: id.clone(),
                object: "chat.completion.chunk",
                created,
                model: model.clone(),
                choices: Vec::new(),
                usage: Some(usage),
            };
            if let Ok(data) = serde_json::to_string(&usage_chunk) {
                yield Ok(Event::default().data(data));
            }
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/completions — not implemented
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn legacy_completions() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "error": {
                "message": "The legacy completions API is not supported; use /v1/chat/completions.",
                "type": "invalid_request_error",
                "code": "not_implemented",
            }
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/responses — simplified single-turn surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

pub async fn responses(
    State(state): State<AppState>,
    Json(body): Json<ResponsesRequest>,
) -> Response {
    let mut params = SamplingParams {
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        ..Default::default()
    };
    let mut messages = vec![ChatMessage::user(body.input.clone())];
    let model_id = match resolve_chat_model(&state, &body.model, &mut params, &mut messages) {
        Ok(model_id) => model_id,
        Err(e) => return e.into_response(),
    };
    let response_id = format!("resp-{}", Uuid::new_v4().simple());

    if !body.stream {
        return match state
            .engine
            .generate(&model_id, &messages, &params, Priority::Normal, None)
            .await
        {
            Ok(completion) => Json(serde_json::json!({
                "id": response_id,
                "object": "response",
                "model": completion.model,
                "output_text": completion.content.unwrap_or_default(),
                "usage": completion.usage,
            }))
            .into_response(),
            Err(e) => ApiError(e).into_response(),
        };
    }

    let chunk_stream = match state
        .engine
        .stream_generate(&model_id, &messages, &params, Priority::Normal, None)
        .await
    {
        Ok(stream) => stream,
        Err(e) => return ApiError(e).into_response(),
    };

    let sse_stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(
            Event::default()
                .event("response.created")
                .data(serde_json::json!({"id": response_id}).to_string()),
        );
        let mut chunk_stream = chunk_stream;
        let mut usage = Usage::default();
        while let Some(item) = chunk_stream.next().await {
            match item {
                Ok(StreamChunk::Token(text)) => {
                    yield Ok(Event::default()
                        .event("response.output_text.delta")
                        .data(serde_json::json!({"delta": text}).to_string()));
                }
                Ok(StreamChunk::End { usage: final_usage }) => usage = final_usage,
                Ok(StreamChunk::ToolCall(_)) => {}
                Err(e) => {
                    yield Ok(Event::default()
                        .event("response.error")
                        .data(error_body(&e).to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default()
            .event("response.completed")
            .data(serde_json::json!({"usage": usage}).to_string()));
    };

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .engine
        .list_infos()
        .into_iter()
        .map(|info| {
            serde_json::json!({
                "id": info.model_id,
                "object": "model",
                "created": info.loaded_at.timestamp(),
                "owned_by": "local",
            })
        })
        .collect();
    Json(serde_json::json!({"object": "list", "data": data}))
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let info = state
        .engine
        .get_info(&model_id)
        .ok_or(Error::ModelNotFound(model_id))?;
    Ok(Json(serde_json::json!({
        "id": info.model_id,
        "object": "model",
        "created": info.loaded_at.timestamp(),
        "owned_by": "local",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_accepts_string_or_list() {
        let one: StopSequences = serde_json::from_str("\"END\"").unwrap();
        assert_eq!(one.into_vec(), vec!["END"]);
        let many: StopSequences = serde_json::from_str("[\"a\", \"b\"]").unwrap();
        assert_eq!(many.into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn request_maps_to_sampling_params() {
        let body: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "stop": "END",
            "num_ctx": 2048,
        }))
        .unwrap();
        let params = body.sampling_params();
        assert_eq!(params.temperature, Some(0.5));
        assert_eq!(params.stop, Some(vec!["END".to_string()]));
        assert_eq!(params.num_ctx, Some(2048));
        assert!(!body.stream);
    }

    #[test]
    fn tool_call_delta_wire_shape() {
        let delta = ToolCallDelta {
            index: 0,
            id: "call_abc".into(),
            name: "get_weather".into(),
            arguments: r#"{"city":"SF"}"#.into(),
        };
        let wire = wire_tool_call_delta(&delta);
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "get_weather");
        assert_eq!(wire["function"]["arguments"], r#"{"city":"SF"}"#);
    }

    #[test]
    fn chunk_delta_omits_empty_fields() {
        let chunk = ChatChunk {
            id: "chatcmpl-x".into(),
            object: "chat.completion.chunk",
            created: 0,
            model: "m".into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some("hi".into()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"content\":\"hi\""));
        assert!(!json.contains("role"));
        assert!(!json.contains("usage"));
        assert!(json.contains("\"finish_reason\":null"));
    }
}
