//! Core domain logic for threadline.
//!
//! This crate turns externally written session logs into normalized conversation turns:
//! - Record parsing: one JSONL line into a typed record or a recoverable error
//! - Content extraction: string/block content into renderable segments
//! - Thread reconstruction: parent-linked records into ordered turns (batch path)
//! - Streaming grouping: live CLI events into the same turns (live path)
//! - Discovery: locating session files and their signatures under the log root

pub mod content;
pub mod cost;
pub mod discovery;
pub mod grouper;
pub mod record;
pub mod thread;
pub mod types;

pub use content::{ContentSegment, SegmentType, extract, render_segments};
pub use discovery::{DiscoveryError, FileSignature, SessionFile, scan_session_files};
pub use grouper::{GroupState, GroupedMessage, StreamingGrouper};
pub use record::{LogEntry, LogRecord, ParseError, RecordKind, StreamEvent, SummaryRecord};
pub use thread::{ConversationThread, ThreadReconstructor, Turn, reconstruct};
pub use types::{Role, SessionId, ValidationError};
