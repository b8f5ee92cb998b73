//! Content extraction shared by the batch and live paths.
//!
//! Message content arrives either as a plain string or as a list of typed blocks. [`extract`]
//! resolves that polymorphism once, into [`ContentSegment`]s, and nothing downstream looks at
//! raw content again. Both the log importer and the live stream go through this function and
//! through [`render_segments`], so a transcript renders byte-identically either way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::RecordKind;

/// Tool output longer than this many characters is truncated.
pub const MAX_TOOL_RESULT_CHARS: usize = 1000;

/// Appended to truncated tool output.
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// Rendered tool parameter values are cut at this many characters.
const MAX_PARAM_CHARS: usize = 120;

/// Maximum title length derived from a first prompt.
const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Text,
    ToolInvocation,
    ToolResult,
    /// Content we do not understand, kept verbatim in [`ContentSegment::raw`].
    Opaque,
}

/// One renderable piece of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSegment {
    pub segment_type: SegmentType,
    /// Display text. Never empty.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ContentSegment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segment_type: SegmentType::Text,
            text: text.into(),
            tool_name: None,
            tool_use_id: None,
            tool_input: None,
            tool_output: None,
            truncated: false,
            raw: None,
        }
    }

    fn opaque(text: String, raw: Value) -> Self {
        Self {
            segment_type: SegmentType::Opaque,
            raw: Some(raw),
            ..Self::text(text)
        }
    }

    fn placeholder(kind: RecordKind) -> Self {
        Self::opaque(format!("[empty {kind} message]"), Value::Null)
    }
}

/// Normalizes raw `message.content` into ordered segments.
///
/// The result is never empty: content that yields nothing renderable becomes a single opaque
/// placeholder so a message can never render blank.
pub fn extract(kind: RecordKind, raw_content: &Value) -> Vec<ContentSegment> {
    let segments = match raw_content {
        Value::String(text) if text.trim().is_empty() => Vec::new(),
        Value::String(text) => vec![ContentSegment::text(text.clone())],
        Value::Array(blocks) => blocks.iter().filter_map(extract_block).collect(),
        Value::Null => Vec::new(),
        other => vec![ContentSegment::opaque(
            format!("[unrecognized content: {}]", json_type_name(other)),
            other.clone(),
        )],
    };

    if segments.is_empty() {
        vec![ContentSegment::placeholder(kind)]
    } else {
        segments
    }
}

fn extract_block(block: &Value) -> Option<ContentSegment> {
    let Some(block_type) = block.get("type").and_then(Value::as_str) else {
        return Some(ContentSegment::opaque(
            "[unrecognized content block]".to_string(),
            block.clone(),
        ));
    };

    match block_type {
        "text" => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
            if text.trim().is_empty() {
                None
            } else {
                Some(ContentSegment::text(text))
            }
        }
        "tool_use" => Some(tool_invocation(block)),
        "tool_result" => Some(tool_result(block)),
        other => Some(ContentSegment::opaque(
            format!("[unrecognized content block: {other}]"),
            block.clone(),
        )),
    }
}

fn tool_invocation(block: &Value) -> ContentSegment {
    let name = block
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unknown tool")
        .to_string();
    let input = block.get("input").cloned().unwrap_or(Value::Null);

    ContentSegment {
        segment_type: SegmentType::ToolInvocation,
        text: render_tool_invocation(&name, &input),
        tool_name: Some(name),
        tool_use_id: block.get("id").and_then(Value::as_str).map(String::from),
        tool_input: Some(input),
        ..ContentSegment::text(String::new())
    }
}

/// Renders a tool call as `Used <name> — key: value, ...` with keys sorted.
pub fn render_tool_invocation(name: &str, input: &Value) -> String {
    let params = match input {
        Value::Null => String::new(),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|key| format!("{key}: {}", render_param(&map[key.as_str()])))
                .collect::<Vec<_>>()
                .join(", ")
        }
        other => render_param(other),
    };

    if params.is_empty() {
        format!("Used {name}")
    } else {
        format!("Used {name} — {params}")
    }
}

fn render_param(value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let (mut cut, truncated) = truncate_chars(&rendered, MAX_PARAM_CHARS);
    if truncated {
        cut.push_str("...");
    }
    cut
}

fn tool_result(block: &Value) -> ContentSegment {
    let output = tool_result_text(block.get("content").unwrap_or(&Value::Null));
    let (mut output, truncated) = truncate_chars(&output, MAX_TOOL_RESULT_CHARS);
    if truncated {
        output.push_str(TRUNCATION_MARKER);
    }

    let is_error = block
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = match (output.trim().is_empty(), is_error) {
        (true, false) => "(no output)".to_string(),
        (true, true) => "Error: (no output)".to_string(),
        (false, false) => output.clone(),
        (false, true) => format!("Error: {output}"),
    };

    ContentSegment {
        segment_type: SegmentType::ToolResult,
        text,
        tool_use_id: block
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(String::from),
        tool_output: Some(output),
        truncated,
        ..ContentSegment::text(String::new())
    }
}

/// Flattens the several shapes tool output can take into plain text.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Some(other) => format!("[{other}]"),
                None => part.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// The canonical text form of a turn. Stored alongside the segments and used for parity checks.
pub fn render_segments(segments: &[ContentSegment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// A session title taken from the first line of a prompt.
pub fn title_from_prompt(prompt: &str) -> Option<String> {
    let first_line = prompt.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (mut title, truncated) = truncate_chars(first_line, MAX_TITLE_CHARS);
    if truncated {
        title.push_str("...");
    }
    Some(title)
}

/// Cuts `s` to at most `max` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> (String, bool) {
    match s.char_indices().nth(max) {
        Some((end, _)) => (s[..end].to_string(), true),
        None => (s.to_string(), false),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
