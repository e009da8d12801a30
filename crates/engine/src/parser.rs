//! XML tool-call parser for model output.
//!
//! Models in the M2.5 family frame tool invocations as XML:
//!
//! ```text
//! <minimax:tool_call>
//! <invoke name="get_weather">
//! <parameter name="city">SF</parameter>
//! </invoke>
//! </minimax:tool_call>
//! ```
//!
//! This module converts that framing into OpenAI-shaped tool calls, both
//! for full text (non-streaming) and token-by-token (streaming). It also
//! strips `<think>…</think>` reasoning blocks, including the M2.5 quirk
//! where the opening tag is missing but `</think>` still appears.
//!
//! The streaming parser never emits a content delta that could be the
//! prefix of a sentinel tag: a safe suffix (at most one tag length) is
//! held back until the next chunk resolves it.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use lmx_domain::chat::ToolCall;
use lmx_domain::stream::ToolCallDelta;

pub const TOOL_CALL_OPEN: &str = "<minimax:tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</minimax:tool_call>";
pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

fn tool_call_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<minimax:tool_call>(.*?)</minimax:tool_call>").unwrap())
}

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)<invoke\s+name="?([^">]+)"?\s*>(.*?)</invoke>"#).unwrap())
}

fn param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<parameter\s+name="?([^">]+)"?\s*>(.*?)</parameter>"#).unwrap()
    })
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").unwrap())
}

fn generate_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thinking removal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remove `<think>…</think>` blocks. Also handles the missing-open-tag
/// quirk: a bare `</think>` discards everything before it.
pub fn strip_thinking(text: &str) -> String {
    let cleaned = think_re().replace_all(text, "");
    let cleaned = match cleaned.find(THINK_CLOSE) {
        Some(idx) => &cleaned[idx + THINK_CLOSE.len()..],
        None => &cleaned,
    };
    cleaned.trim().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed parameter coercion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Look up a parameter's schema in the OpenAI tools array.
fn param_schema<'a>(
    tools: Option<&'a [serde_json::Value]>,
    func_name: &str,
    param_name: &str,
) -> Option<&'a serde_json::Value> {
    for tool in tools? {
        let func = if tool.get("type").and_then(|t| t.as_str()) == Some("function") {
            tool.get("function")?
        } else {
            tool
        };
        if func.get("name").and_then(|n| n.as_str()) == Some(func_name) {
            return func
                .get("parameters")?
                .get("properties")?
                .get(param_name);
        }
    }
    None
}

fn convert_by_type(value: &str, type_name: &str) -> Option<serde_json::Value> {
    match type_name {
        "string" => Some(serde_json::Value::String(value.to_string())),
        "integer" => value
            .parse::<i64>()
            .ok()
            .map(|i| serde_json::Value::Number(i.into())),
        "number" => value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number),
        "boolean" => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(serde_json::Value::Bool(true)),
            "false" | "0" | "no" => Some(serde_json::Value::Bool(false)),
            _ => None,
        },
        "null" => Some(serde_json::Value::Null),
        "object" | "array" => serde_json::from_str(value).ok(),
        _ => Some(try_json_parse(value)),
    }
}

fn try_json_parse(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

/// Convert a raw parameter string to a typed JSON value per its schema.
/// `anyOf`/`oneOf` variants are tried in order; the string is the final
/// fallback.
pub fn convert_param_value(value: &str, schema: Option<&serde_json::Value>) -> serde_json::Value {
    let value = value.trim();
    let Some(schema) = schema else {
        return try_json_parse(value);
    };

    if let Some(type_name) = schema.get("type").and_then(|t| t.as_str()) {
        return convert_by_type(value, type_name)
            .unwrap_or_else(|| serde_json::Value::String(value.to_string()));
    }

    for key in ["anyOf", "oneOf"] {
        if let Some(variants) = schema.get(key).and_then(|v| v.as_array()) {
            for variant in variants {
                if let Some(vtype) = variant.get("type").and_then(|t| t.as_str()) {
                    if let Some(converted) = convert_by_type(value, vtype) {
                        return converted;
                    }
                }
            }
            return serde_json::Value::String(value.to_string());
        }
    }

    try_json_parse(value)
}

fn parse_invoke_params(
    invoke_body: &str,
    func_name: &str,
    tools: Option<&[serde_json::Value]>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut params = serde_json::Map::new();
    for capture in param_re().captures_iter(invoke_body) {
        let name = capture[1].trim().trim_matches('"').to_string();
        let raw = &capture[2];
        let schema = param_schema(tools, func_name, &name);
        params.insert(name, convert_param_value(raw, schema));
    }
    params
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of parsing full model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ParsedOutput {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Parse tool calls out of complete model output.
pub fn parse_tool_calls(text: &str, tools: Option<&[serde_json::Value]>) -> ParsedOutput {
    let text = strip_thinking(text);

    let Some(first_block) = tool_call_block_re().find(&text) else {
        return ParsedOutput {
            content: (!text.is_empty()).then(|| text.clone()),
            tool_calls: Vec::new(),
        };
    };

    let content_before = text[..first_block.start()].trim();
    let content_before = (!content_before.is_empty()).then(|| content_before.to_string());

    let mut tool_calls = Vec::new();
    for block in tool_call_block_re().captures_iter(&text) {
        for invoke in invoke_re().captures_iter(&block[1]) {
            let func_name = invoke[1].trim().trim_matches('"').to_string();
            let params = parse_invoke_params(&invoke[2], &func_name, tools);
            tool_calls.push(ToolCall {
                id: generate_call_id(),
                name: func_name,
                arguments: serde_json::Value::Object(params).to_string(),
            });
        }
    }

    if tool_calls.is_empty() {
        return ParsedOutput {
            content: (!text.is_empty()).then(|| text.clone()),
            tool_calls,
        };
    }

    ParsedOutput {
        content: content_before,
        tool_calls,
    }
}

/// Inverse of [`parse_tool_calls`] for a pure tool-call payload; used by
/// tests and the benchmark harness to build synthetic model output.
pub fn render_tool_calls(calls: &[(String, serde_json::Value)]) -> String {
    let mut out = String::from(TOOL_CALL_OPEN);
    for (name, args) in calls {
        out.push_str(&format!("\n<invoke name=\"{name}\">"));
        if let Some(object) = args.as_object() {
            for (key, value) in object {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&format!(
                    "\n<parameter name=\"{key}\">{rendered}</parameter>"
                ));
            }
        }
        out.push_str("\n</invoke>");
    }
    out.push('\n');
    out.push_str(TOOL_CALL_CLOSE);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Content,
    Thinking,
    InToolCall,
    Done,
}

/// Result of feeding one chunk to the streaming parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingParseResult {
    pub content_delta: Option<String>,
    pub tool_call_deltas: Vec<ToolCallDelta>,
    pub buffered: bool,
}

/// Stateful streaming parser. Feed token chunks; partial XML is buffered
/// and emitted once complete.
pub struct StreamingToolParser {
    tools: Option<Vec<serde_json::Value>>,
    full_text: String,
    content_emitted_to: usize,
    tool_calls_emitted: usize,
    tool_index: usize,
    state: ParserState,
    thinking_checked: bool,
}

impl StreamingToolParser {
    pub fn new(tools: Option<Vec<serde_json::Value>>) -> Self {
        Self {
            tools,
            full_text: String::new(),
            content_emitted_to: 0,
            tool_calls_emitted: 0,
            tool_index: 0,
            state: ParserState::Content,
            thinking_checked: false,
        }
    }

    /// Whether any tool call has been emitted so far.
    pub fn saw_tool_calls(&self) -> bool {
        self.tool_calls_emitted > 0
    }

    pub fn feed(&mut self, chunk: &str) -> StreamingParseResult {
        self.full_text.push_str(chunk);

        if self.state == ParserState::Thinking {
            return self.handle_thinking();
        }

        if !self.thinking_checked && self.state == ParserState::Content {
            if let Some(result) = self.check_thinking_start() {
                return result;
            }
        }

        match self.state {
            ParserState::Content => self.handle_content(),
            ParserState::InToolCall => self.handle_tool_call(),
            _ => StreamingParseResult::default(),
        }
    }

    /// Flush remaining buffered content after the stream ends.
    pub fn flush(&mut self) -> StreamingParseResult {
        match self.state {
            ParserState::Content => {
                let remaining = self.full_text[self.content_emitted_to..].to_string();
                self.content_emitted_to = self.full_text.len();
                if remaining.is_empty() {
                    StreamingParseResult::default()
                } else {
                    StreamingParseResult {
                        content_delta: Some(remaining),
                        ..Default::default()
                    }
                }
            }
            ParserState::InToolCall => self.handle_tool_call(),
            _ => StreamingParseResult::default(),
        }
    }

    // ── Thinking ───────────────────────────────────────────────────────

    fn check_thinking_start(&mut self) -> Option<StreamingParseResult> {
        let stripped = self.full_text.trim_start();

        if stripped.starts_with(THINK_OPEN) {
            self.state = ParserState::Thinking;
            self.thinking_checked = true;
            return Some(StreamingParseResult {
                buffered: true,
                ..Default::default()
            });
        }

        // Could still be a partial "<thi" prefix; keep buffering.
        if !stripped.is_empty() && THINK_OPEN.starts_with(stripped) {
            return Some(StreamingParseResult {
                buffered: true,
                ..Default::default()
            });
        }

        self.thinking_checked = true;
        None
    }

    fn handle_thinking(&mut self) -> StreamingParseResult {
        if let Some(idx) = self.full_text.find(THINK_CLOSE) {
            self.full_text = self.full_text[idx + THINK_CLOSE.len()..].to_string();
            self.content_emitted_to = 0;
            self.state = ParserState::Content;
            return self.handle_content();
        }
        StreamingParseResult {
            buffered: true,
            ..Default::default()
        }
    }

    // ── Content ────────────────────────────────────────────────────────

    fn handle_content(&mut self) -> StreamingParseResult {
        if let Some(tc_pos) = self.full_text.find(TOOL_CALL_OPEN) {
            let new_content = &self.full_text[self.content_emitted_to..tc_pos];
            let content_delta = if new_content.trim().is_empty() {
                None
            } else {
                Some(new_content.trim_end().to_string())
            };
            self.content_emitted_to = tc_pos;
            self.state = ParserState::InToolCall;

            let tool_call_deltas = self.parse_new_invokes();
            return StreamingParseResult {
                content_delta,
                tool_call_deltas,
                buffered: false,
            };
        }

        let safe_end = self.find_safe_content_end();
        let new_content = self.full_text[self.content_emitted_to..safe_end].to_string();
        self.content_emitted_to = safe_end;

        if new_content.is_empty() {
            StreamingParseResult {
                buffered: safe_end < self.full_text.len(),
                ..Default::default()
            }
        } else {
            StreamingParseResult {
                content_delta: Some(new_content),
                ..Default::default()
            }
        }
    }

    /// Largest prefix that cannot be the start of a sentinel tag. Looks
    /// back at most one tag length from the end of the buffer.
    fn find_safe_content_end(&self) -> usize {
        let bytes = self.full_text.as_bytes();
        let len = bytes.len();
        let search_start = len
            .saturating_sub(TOOL_CALL_OPEN.len())
            .max(self.content_emitted_to);

        let mut i = len;
        while i > search_start {
            i -= 1;
            if bytes[i] == b'<' {
                let suffix = &self.full_text[i..];
                let is_sentinel_prefix = [TOOL_CALL_OPEN, TOOL_CALL_CLOSE, THINK_OPEN, THINK_CLOSE]
                    .iter()
                    .any(|tag| tag.starts_with(suffix));
                if is_sentinel_prefix {
                    return i;
                }
                break;
            }
        }
        len
    }

    // ── Tool call ──────────────────────────────────────────────────────

    fn handle_tool_call(&mut self) -> StreamingParseResult {
        let tool_call_deltas = self.parse_new_invokes();

        if self.full_text.contains(TOOL_CALL_CLOSE) {
            self.state = ParserState::Done;
        }

        StreamingParseResult {
            buffered: tool_call_deltas.is_empty(),
            tool_call_deltas,
            content_delta: None,
        }
    }

    fn parse_new_invokes(&mut self) -> Vec<ToolCallDelta> {
        let Some(tc_start) = self.full_text.find(TOOL_CALL_OPEN) else {
            return Vec::new();
        };
        let search_text = &self.full_text[tc_start..];

        let mut deltas = Vec::new();
        for invoke in invoke_re()
            .captures_iter(search_text)
            .skip(self.tool_calls_emitted)
        {
            let func_name = invoke[1].trim().trim_matches('"').to_string();
            let params = parse_invoke_params(&invoke[2], &func_name, self.tools.as_deref());
            deltas.push(ToolCallDelta {
                index: self.tool_index,
                id: generate_call_id(),
                name: func_name,
                arguments: serde_json::Value::Object(params).to_string(),
            });
            self.tool_index += 1;
        }
        self.tool_calls_emitted += deltas.len();
        deltas
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_tools() -> Vec<serde_json::Value> {
        vec![serde_json::json!({
            "type": "function",
            "function": {
                "name": "get_weather",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "city": {"type": "string"},
                        "days": {"type": "integer"},
                        "detailed": {"type": "boolean"},
                        "coords": {"type": "object"},
                        "scale": {"anyOf": [{"type": "number"}, {"type": "string"}]}
                    }
                }
            }
        })]
    }

    // ── strip_thinking ──────────────────────────────────────────────

    #[test]
    fn strips_standard_think_block() {
        assert_eq!(strip_thinking("<think>reasoning</think>answer"), "answer");
    }

    #[test]
    fn strips_missing_open_tag_quirk() {
        assert_eq!(strip_thinking("reasoning</think>answer"), "answer");
    }

    #[test]
    fn passes_plain_text_through() {
        assert_eq!(strip_thinking("  answer  "), "answer");
    }

    // ── convert_param_value ─────────────────────────────────────────

    #[test]
    fn coerces_by_schema_type() {
        let int_schema = serde_json::json!({"type": "integer"});
        assert_eq!(
            convert_param_value("42", Some(&int_schema)),
            serde_json::json!(42)
        );

        let bool_schema = serde_json::json!({"type": "boolean"});
        assert_eq!(
            convert_param_value("yes", Some(&bool_schema)),
            serde_json::json!(true)
        );
        assert_eq!(
            convert_param_value("0", Some(&bool_schema)),
            serde_json::json!(false)
        );

        let obj_schema = serde_json::json!({"type": "object"});
        assert_eq!(
            convert_param_value(r#"{"a": 1}"#, Some(&obj_schema)),
            serde_json::json!({"a": 1})
        );

        // A string schema keeps digits as a string.
        let str_schema = serde_json::json!({"type": "string"});
        assert_eq!(
            convert_param_value("42", Some(&str_schema)),
            serde_json::json!("42")
        );
    }

    #[test]
    fn any_of_tries_variants_in_order() {
        let schema = serde_json::json!({"anyOf": [{"type": "integer"}, {"type": "string"}]});
        assert_eq!(convert_param_value("7", Some(&schema)), serde_json::json!(7));
        assert_eq!(
            convert_param_value("seven", Some(&schema)),
            serde_json::json!("seven")
        );
    }

    #[test]
    fn no_schema_tries_json() {
        assert_eq!(convert_param_value("3", None), serde_json::json!(3));
        assert_eq!(convert_param_value("hi", None), serde_json::json!("hi"));
    }

    // ── Non-streaming parse ─────────────────────────────────────────

    #[test]
    fn parses_single_tool_call_with_content() {
        let output = "Sure.<minimax:tool_call><invoke name=\"get_weather\">\
                      <parameter name=\"city\">SF</parameter></invoke></minimax:tool_call>";
        let parsed = parse_tool_calls(output, Some(&weather_tools()));
        assert_eq!(parsed.content.as_deref(), Some("Sure."));
        assert_eq!(parsed.tool_calls.len(), 1);
        let call = &parsed.tool_calls[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"city":"SF"}"#);
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.id.len(), "call_".len() + 24);
    }

    #[test]
    fn parses_multiple_invokes() {
        let output = "<minimax:tool_call>\
                      <invoke name=\"a\"></invoke>\
                      <invoke name=\"b\"></invoke>\
                      </minimax:tool_call>";
        let parsed = parse_tool_calls(output, None);
        assert_eq!(parsed.tool_calls.len(), 2);
        assert_ne!(parsed.tool_calls[0].id, parsed.tool_calls[1].id);
        assert!(parsed.content.is_none());
    }

    #[test]
    fn no_tool_calls_returns_content() {
        let parsed = parse_tool_calls("just text", None);
        assert!(!parsed.has_tool_calls());
        assert_eq!(parsed.content.as_deref(), Some("just text"));
    }

    #[test]
    fn thinking_removed_before_parsing() {
        let output = "<think>hmm</think>hello";
        let parsed = parse_tool_calls(output, None);
        assert_eq!(parsed.content.as_deref(), Some("hello"));
    }

    #[test]
    fn render_parse_roundtrip() {
        let calls = vec![
            ("get_weather".to_string(), serde_json::json!({"city": "SF"})),
            ("lookup".to_string(), serde_json::json!({"days": 3})),
        ];
        let rendered = render_tool_calls(&calls);
        let parsed = parse_tool_calls(&rendered, Some(&weather_tools()));
        assert_eq!(parsed.tool_calls.len(), 2);
        assert_eq!(parsed.tool_calls[0].name, "get_weather");
        assert_eq!(parsed.tool_calls[0].arguments, r#"{"city":"SF"}"#);
        assert_eq!(parsed.tool_calls[1].name, "lookup");
        assert_eq!(parsed.tool_calls[1].arguments, r#"{"days":3}"#);
    }

    // ── Streaming ───────────────────────────────────────────────────

    #[test]
    fn streaming_plain_content_passes_through() {
        let mut parser = StreamingToolParser::new(None);
        let result = parser.feed("hello ");
        assert_eq!(result.content_delta.as_deref(), Some("hello "));
        let result = parser.feed("world");
        assert_eq!(result.content_delta.as_deref(), Some("world"));
        assert!(parser.flush().content_delta.is_none());
        assert!(!parser.saw_tool_calls());
    }

    #[test]
    fn streaming_extracts_tool_call() {
        let mut parser = StreamingToolParser::new(Some(weather_tools()));
        let mut content = String::new();
        let mut deltas = Vec::new();

        let chunks = [
            "Sure.",
            "<minimax:tool_call><invoke name=\"get_weather\">",
            "<parameter name=\"city\">SF</parameter>",
            "</invoke></minimax:tool_call>",
        ];
        for chunk in chunks {
            let result = parser.feed(chunk);
            if let Some(delta) = result.content_delta {
                content.push_str(&delta);
            }
            deltas.extend(result.tool_call_deltas);
        }
        let result = parser.flush();
        deltas.extend(result.tool_call_deltas);

        assert_eq!(content, "Sure.");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].index, 0);
        assert_eq!(deltas[0].name, "get_weather");
        assert_eq!(deltas[0].arguments, r#"{"city":"SF"}"#);
    }

    #[test]
    fn streaming_holds_back_possible_tag_prefix() {
        let mut parser = StreamingToolParser::new(None);
        // "<minimax" could be the start of the sentinel; nothing is emitted.
        let result = parser.feed("text <minimax");
        assert_eq!(result.content_delta.as_deref(), Some("text "));

        // It turns out to be plain text after all.
        let result = parser.feed(" is a company");
        assert_eq!(result.content_delta.as_deref(), Some("<minimax is a company"));
    }

    #[test]
    fn streaming_token_by_token_tag() {
        let output = "Hi<minimax:tool_call><invoke name=\"f\"></invoke></minimax:tool_call>";
        // Feed one byte at a time; content must come out exactly once and
        // no XML may leak.
        let mut parser = StreamingToolParser::new(None);
        let mut content = String::new();
        let mut deltas = Vec::new();
        for ch in output.chars() {
            let result = parser.feed(&ch.to_string());
            if let Some(delta) = result.content_delta {
                content.push_str(&delta);
            }
            deltas.extend(result.tool_call_deltas);
        }
        let result = parser.flush();
        if let Some(delta) = result.content_delta {
            content.push_str(&delta);
        }
        deltas.extend(result.tool_call_deltas);

        assert_eq!(content, "Hi");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].name, "f");
    }

    #[test]
    fn streaming_thinking_buffered() {
        let mut parser = StreamingToolParser::new(None);
        assert!(parser.feed("<think>").buffered);
        assert!(parser.feed("pondering...").buffered);
        let result = parser.feed("</think>answer");
        assert_eq!(result.content_delta.as_deref(), Some("answer"));
    }

    #[test]
    fn streaming_think_block_resolves_on_close() {
        let mut parser = StreamingToolParser::new(None);
        // The open tag and reasoning arrive first and stay buffered.
        assert!(parser.feed("<think>inner").buffered);
        let result = parser.feed("</think>after");
        assert_eq!(result.content_delta.as_deref(), Some("after"));
    }

    #[test]
    fn streaming_multiple_tool_calls_monotonic_index() {
        let output = "<minimax:tool_call>\
                      <invoke name=\"a\"></invoke>\
                      <invoke name=\"b\"></invoke>\
                      </minimax:tool_call>";
        let mut parser = StreamingToolParser::new(None);
        let result = parser.feed(output);
        assert_eq!(result.tool_call_deltas.len(), 2);
        assert_eq!(result.tool_call_deltas[0].index, 0);
        assert_eq!(result.tool_call_deltas[1].index, 1);
        assert!(parser.saw_tool_calls());
        // Feeding trailing data after DONE emits nothing further.
        let result = parser.feed("extra");
        assert!(result.tool_call_deltas.is_empty());
        assert!(result.content_delta.is_none());
    }

    #[test]
    fn streaming_flush_emits_remaining_content() {
        let mut parser = StreamingToolParser::new(None);
        // "<th" held back as a potential think prefix at stream start.
        let first = parser.feed("<th");
        assert!(first.buffered);
        let result = parser.flush();
        assert_eq!(result.content_delta.as_deref(), Some("<th"));
    }

    #[test]
    fn streaming_typed_arguments() {
        let output = "<minimax:tool_call><invoke name=\"get_weather\">\
                      <parameter name=\"days\">3</parameter>\
                      <parameter name=\"detailed\">true</parameter>\
                      </invoke></minimax:tool_call>";
        let mut parser = StreamingToolParser::new(Some(weather_tools()));
        let result = parser.feed(output);
        assert_eq!(result.tool_call_deltas.len(), 1);
        let arguments: serde_json::Value =
            serde_json::from_str(&result.tool_call_deltas[0].arguments).unwrap();
        assert_eq!(arguments["days"], serde_json::json!(3));
        assert_eq!(arguments["detailed"], serde_json::json!(true));
    }
}
