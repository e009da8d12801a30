//! WebSocket chat channel — `WS /v1/chat/stream`.
//!
//! Client → server: `chat.request` (one inference per request_id) and
//! `chat.cancel`. Server → client: `chat.token`, `chat.done`,
//! `chat.error`. Multiple requests may be in flight on one socket; each
//! runs in its own task and cancelling (or dropping the socket) aborts
//! generation and releases its lane slots.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use lmx_domain::chat::{ChatMessage, Priority, SamplingParams};
use lmx_domain::stream::StreamChunk;

use crate::api::chat::{resolve_chat_model, StopSequences};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "chat.request")]
    ChatRequest {
        #[serde(default)]
        request_id: Option<String>,
        model: String,
        messages: Vec<ChatMessage>,
        #[serde(default = "default_true")]
        stream: bool,
        #[serde(default)]
        tools: Option<Vec<serde_json::Value>>,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        top_p: Option<f64>,
        #[serde(default)]
        stop: Option<StopSequences>,
    },
    #[serde(rename = "chat.cancel")]
    ChatCancel { request_id: String },
}

fn default_true() -> bool {
    true
}

fn token_message(request_id: &str, content: &str) -> serde_json::Value {
    serde_json::json!({"type": "chat.token", "request_id": request_id, "content": content})
}

fn done_message(
    request_id: &str,
    finish_reason: &str,
    content: Option<String>,
    usage: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut message = serde_json::json!({
        "type": "chat.done",
        "request_id": request_id,
        "finish_reason": finish_reason,
    });
    if let Some(content) = content {
        message["content"] = serde_json::Value::String(content);
    }
    if let Some(usage) = usage {
        message["usage"] = usage;
    }
    message
}

fn error_message(request_id: Option<&str>, error: &str) -> serde_json::Value {
    let mut message = serde_json::json!({"type": "chat.error", "error": error});
    if let Some(request_id) = request_id {
        message["request_id"] = serde_json::Value::String(request_id.to_string());
    }
    message
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(64);
    let active: Arc<Mutex<HashMap<String, tokio::task::AbortHandle>>> =
        Arc::new(Mutex::new(HashMap::new()));

    // Writer: serializes all server messages onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink
                .send(Message::Text(message.to_string()))
                .await
                .is_err()
            {
                return;
            }
        }
    });

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = out_tx
                    .send(error_message(None, &format!("invalid message: {e}")))
                    .await;
                continue;
            }
        };

        match parsed {
            ClientMessage::ChatCancel { request_id } => {
                let handle = active.lock().remove(&request_id);
                if let Some(handle) = handle {
                    handle.abort();
                    let _ = out_tx
                        .send(done_message(&request_id, "cancelled", None, None))
                        .await;
                } else {
                    let _ = out_tx
                        .send(error_message(
                            Some(&request_id),
                            "unknown or already-finished request",
                        ))
                        .await;
                }
            }
            ClientMessage::ChatRequest {
                request_id,
                model,
                messages,
                stream,
                tools,
                temperature,
                max_tokens,
                top_p,
                stop,
            } => {
                let request_id = request_id
                    .unwrap_or_else(|| format!("wsreq-{}", &Uuid::new_v4().simple().to_string()[..12]));
                let state = state.clone();
                let out_tx = out_tx.clone();
                let active_for_task = active.clone();
                let id = request_id.clone();

                let task = tokio::spawn(async move {
                    run_chat_request(
                        state, &out_tx, &id, model, messages, stream, tools, temperature,
                        max_tokens, top_p, stop,
                    )
                    .await;
                    active_for_task.lock().remove(&id);
                });
                active
                    .lock()
                    .insert(request_id, task.abort_handle());
            }
        }
    }

    // Socket gone: abort in-flight generations (their slots release on
    // stream drop) and stop the writer.
    for (_, handle) in active.lock().drain() {
        handle.abort();
    }
    writer.abort();
}

#[allow(clippy::too_many_arguments)]
async fn run_chat_request(
    state: AppState,
    out_tx: &mpsc::Sender<serde_json::Value>,
    request_id: &str,
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    tools: Option<Vec<serde_json::Value>>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    top_p: Option<f64>,
    stop: Option<StopSequences>,
) {
    let mut params = SamplingParams {
        temperature,
        max_tokens,
        top_p,
        stop: stop.map(StopSequences::into_vec),
        tools,
        ..Default::default()
    };
    let mut messages = messages;
    let model_id = match resolve_chat_model(&state, &model, &mut params, &mut messages) {
        Ok(model_id) => model_id,
        Err(e) => {
            let _ = out_tx
                .send(error_message(Some(request_id), &e.0.to_string()))
                .await;
            return;
        }
    };

    if !stream {
        match state
            .engine
            .generate(&model_id, &messages, &params, Priority::Normal, None)
            .await
        {
            Ok(completion) => {
                let usage = serde_json::to_value(completion.usage).ok();
                let _ = out_tx
                    .send(done_message(
                        request_id,
                        &completion.finish_reason,
                        completion.content,
                        usage,
                    ))
                    .await;
            }
            Err(e) => {
                let _ = out_tx
                    .send(error_message(Some(request_id), &e.to_string()))
                    .await;
            }
        }
        return;
    }

    let mut chunk_stream = match state
        .engine
        .stream_generate(&model_id, &messages, &params, Priority::Normal, None)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = out_tx
                .send(error_message(Some(request_id), &e.to_string()))
                .await;
            return;
        }
    };

    let mut usage = None;
    while let Some(item) = chunk_stream.next().await {
        match item {
            Ok(StreamChunk::Token(text)) => {
                if out_tx.send(token_message(request_id, &text)).await.is_err() {
                    return;
                }
            }
            Ok(StreamChunk::ToolCall(_)) => {}
            Ok(StreamChunk::End { usage: final_usage }) => {
                usage = serde_json::to_value(final_usage).ok();
            }
            Err(e) => {
                let _ = out_tx
                    .send(error_message(Some(request_id), &e.to_string()))
                    .await;
                return;
            }
        }
    }
    let _ = out_tx
        .send(done_message(request_id, "stop", None, usage))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse() {
        let request: ClientMessage = serde_json::from_value(serde_json::json!({
            "type": "chat.request",
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        match request {
            ClientMessage::ChatRequest { stream, model, .. } => {
                assert!(stream); // streaming is the default
                assert_eq!(model, "m");
            }
            _ => panic!("wrong variant"),
        }

        let cancel: ClientMessage = serde_json::from_value(serde_json::json!({
            "type": "chat.cancel",
            "request_id": "r1",
        }))
        .unwrap();
        assert!(matches!(cancel, ClientMessage::ChatCancel { .. }));
    }

    #[test]
    fn server_message_shapes() {
        let token = token_message("r1", "hi");
        assert_eq!(token["type"], "chat.token");
        assert_eq!(token["request_id"], "r1");

        let done = done_message("r1", "stop", Some("all".into()), None);
        assert_eq!(done["type"], "chat.done");
        assert_eq!(done["finish_reason"], "stop");
        assert_eq!(done["content"], "all");
        assert!(done.get("usage").is_none());

        let error = error_message(None, "boom");
        assert_eq!(error["type"], "chat.error");
        assert!(error.get("request_id").is_none());
    }
}
