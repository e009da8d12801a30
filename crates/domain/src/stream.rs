//! Streaming types.
//!
//! A generation stream is a finite, producer-driven sequence of
//! [`StreamChunk`]s ending with exactly one `End` sentinel that carries the
//! completion token count, so the SSE layer can emit usage without
//! re-counting.

use std::pin::Pin;

use serde::Serialize;

use crate::chat::Usage;
use crate::error::Result;

/// A boxed async stream, used for backend token streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Stream of parsed chunks as produced by the engine.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// Raw token stream as produced by a backend.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Incremental tool-call data for streaming responses.
///
/// `id` and `name` are present exactly once per distinct call (the first
/// time the invoke is seen); `arguments` holds the full JSON-encoded
/// argument object for that call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A typed chunk in a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Plain content text.
    Token(String),
    /// A parsed tool invocation.
    ToolCall(ToolCallDelta),
    /// End-of-stream marker with the final counts.
    End { usage: Usage },
}

impl StreamChunk {
    pub fn is_end(&self) -> bool {
        matches!(self, StreamChunk::End { .. })
    }
}
