//! Record parser for session log lines.
//!
//! Every line of a session log is an independent JSON document. [`parse`] turns one line into a
//! [`LogEntry`] or a [`ParseError`] that still carries the raw line, so a caller can log the
//! failure and keep going with the next line. Nothing here ever aborts a batch.
//!
//! Live output from the CLI uses the same record shapes plus two control events (`system` and
//! `result`); [`parse_stream_event`] accepts those as well.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Role, SessionId};

/// Maximum number of bytes of a raw line echoed back in log output.
const PREVIEW_LENGTH: usize = 200;

/// The `type` tag of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Summary,
    User,
    Assistant,
}

impl RecordKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// The role of a message record; `None` for summaries.
    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        match self {
            Self::Summary => None,
            Self::User => Some(Role::User),
            Self::Assistant => Some(Role::Assistant),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid JSON: {message}")]
    InvalidJson { message: String, line: String },
    /// A required field is absent or empty (schema violation).
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str, line: String },
    #[error("unknown record type `{kind}`")]
    UnknownType { kind: String, line: String },
    #[error("invalid timestamp `{value}`: expected ISO-8601 with a `Z` suffix")]
    InvalidTimestamp { value: String, line: String },
}

impl ParseError {
    /// The offending line, verbatim.
    pub fn raw_line(&self) -> &str {
        match self {
            Self::InvalidJson { line, .. }
            | Self::MissingField { line, .. }
            | Self::UnknownType { line, .. }
            | Self::InvalidTimestamp { line, .. } => line,
        }
    }

    /// A bounded prefix of the raw line for log output.
    pub fn preview(&self) -> &str {
        let line = self.raw_line();
        if line.len() <= PREVIEW_LENGTH {
            return line;
        }
        let mut end = PREVIEW_LENGTH;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        &line[..end]
    }
}

/// One user or assistant record from a session log.
///
/// Records are ephemeral: they are parsed, turned into content segments and turns, and then
/// dropped. Only their identity (uuid, session, cost) is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub cwd: Option<String>,
    pub is_sidechain: bool,
    /// The `message` object (role, content, model, usage).
    pub payload: Value,
}

impl LogRecord {
    /// The role of this record. Message records are never summaries.
    pub fn role(&self) -> Role {
        self.kind.role().unwrap_or(Role::User)
    }

    /// The `message.content` value, `Null` when absent.
    pub fn content(&self) -> &Value {
        self.payload.get("content").unwrap_or(&Value::Null)
    }

    pub fn model(&self) -> Option<&str> {
        self.payload.get("model").and_then(Value::as_str)
    }

    /// The API-level message id. Several log records can share one.
    pub fn api_message_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// Ids of `tool_use` blocks in this record, in content order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks_of_type("tool_use", "id")
    }

    /// Ids referenced by `tool_result` blocks in this record, in content order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks_of_type("tool_result", "tool_use_id")
    }

    /// A user record carrying tool output rather than a typed prompt.
    pub fn is_tool_result(&self) -> bool {
        self.kind == RecordKind::User && !self.tool_result_ids().is_empty()
    }

    fn blocks_of_type(&self, block_type: &str, id_field: &str) -> Vec<&str> {
        let Some(blocks) = self.content().as_array() else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some(block_type))
            .filter_map(|block| block.get(id_field).and_then(Value::as_str))
            .collect()
    }
}

/// A `summary` line: a title attached to the leaf of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub title: String,
    pub leaf_uuid: Option<String>,
}

/// A successfully parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Summary(SummaryRecord),
    Message(LogRecord),
}

/// Completion event emitted by the CLI at the end of a live exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEvent {
    pub session_id: Option<SessionId>,
    pub subtype: Option<String>,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub total_cost_usd: Option<f64>,
}

/// A line from the live event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Entry(LogEntry),
    /// Session initialization (`type: "system"`).
    Init {
        session_id: Option<SessionId>,
        model: Option<String>,
        cwd: Option<String>,
    },
    Result(ResultEvent),
}

/// Wire shape shared by log lines and stream events. Everything is optional so that a missing
/// field turns into a [`ParseError::MissingField`] instead of an opaque serde message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    uuid: Option<String>,
    parent_uuid: Option<String>,
    session_id: Option<String>,
    /// Stream events spell it `session_id`. Lines may carry both; `sessionId` wins.
    #[serde(rename = "session_id")]
    stream_session_id: Option<String>,
    timestamp: Option<String>,
    summary: Option<String>,
    leaf_uuid: Option<String>,
    cwd: Option<String>,
    #[serde(default)]
    is_sidechain: bool,
    message: Option<Value>,
    subtype: Option<String>,
    model: Option<String>,
    #[serde(default, rename = "is_error")]
    is_error: bool,
    #[serde(rename = "duration_ms")]
    duration_ms: Option<u64>,
    #[serde(rename = "num_turns")]
    num_turns: Option<u64>,
    #[serde(rename = "total_cost_usd")]
    total_cost_usd: Option<f64>,
}

/// Parses one session log line.
pub fn parse(line: &str) -> Result<LogEntry, ParseError> {
    let raw = decode(line)?;
    entry_from_raw(raw, line)
}

/// Parses one line of live CLI output.
///
/// Stream messages may omit `timestamp` and `uuid`; those default to `received_at` and a fresh
/// v4 uuid. A timestamp that is present is still validated strictly.
pub fn parse_stream_event(line: &str, received_at: DateTime<Utc>) -> Result<StreamEvent, ParseError> {
    let mut raw = decode(line)?;
    match raw.kind.as_deref() {
        Some("system") => Ok(StreamEvent::Init {
            session_id: raw.session_id.and_then(|id| SessionId::new(id).ok()),
            model: raw.model,
            cwd: raw.cwd,
        }),
        Some("result") => Ok(StreamEvent::Result(ResultEvent {
            session_id: raw.session_id.and_then(|id| SessionId::new(id).ok()),
            subtype: raw.subtype,
            is_error: raw.is_error,
            duration_ms: raw.duration_ms,
            num_turns: raw.num_turns,
            total_cost_usd: raw.total_cost_usd,
        })),
        Some("user" | "assistant") => {
            raw.timestamp.get_or_insert_with(|| {
                received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            });
            raw.uuid.get_or_insert_with(|| Uuid::new_v4().to_string());
            entry_from_raw(raw, line).map(StreamEvent::Entry)
        }
        _ => entry_from_raw(raw, line).map(StreamEvent::Entry),
    }
}

/// Parses a strict ISO-8601 UTC timestamp (`2025-01-01T10:00:00.000Z`).
///
/// Offsets other than the literal `Z` suffix are rejected rather than normalized.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if !value.ends_with('Z') {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn decode(line: &str) -> Result<RawLine, ParseError> {
    let mut raw: RawLine =
        serde_json::from_str(line.trim()).map_err(|e| ParseError::InvalidJson {
            message: e.to_string(),
            line: line.to_string(),
        })?;
    if raw.session_id.is_none() {
        raw.session_id = raw.stream_session_id.take();
    }
    Ok(raw)
}

fn entry_from_raw(raw: RawLine, line: &str) -> Result<LogEntry, ParseError> {
    let missing = |field: &'static str| ParseError::MissingField {
        field,
        line: line.to_string(),
    };

    let kind = match non_empty(raw.kind).ok_or_else(|| missing("type"))?.as_str() {
        "summary" => RecordKind::Summary,
        "user" => RecordKind::User,
        "assistant" => RecordKind::Assistant,
        other => {
            return Err(ParseError::UnknownType {
                kind: other.to_string(),
                line: line.to_string(),
            });
        }
    };

    if kind == RecordKind::Summary {
        let title = non_empty(raw.summary).ok_or_else(|| missing("summary"))?;
        return Ok(LogEntry::Summary(SummaryRecord {
            title,
            leaf_uuid: non_empty(raw.leaf_uuid),
        }));
    }

    let uuid = non_empty(raw.uuid).ok_or_else(|| missing("uuid"))?;
    let session_id = raw
        .session_id
        .and_then(|id| SessionId::new(id).ok())
        .ok_or_else(|| missing("sessionId"))?;
    let timestamp_raw = non_empty(raw.timestamp).ok_or_else(|| missing("timestamp"))?;
    let timestamp =
        parse_timestamp(&timestamp_raw).ok_or_else(|| ParseError::InvalidTimestamp {
            value: timestamp_raw.clone(),
            line: line.to_string(),
        })?;

    Ok(LogEntry::Message(LogRecord {
        uuid,
        parent_uuid: non_empty(raw.parent_uuid),
        session_id,
        timestamp,
        kind,
        cwd: non_empty(raw.cwd),
        is_sidechain: raw.is_sidechain,
        payload: raw.message.unwrap_or(Value::Null),
    }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
