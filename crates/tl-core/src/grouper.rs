//! Streaming grouper for the live path.
//!
//! Live CLI output arrives one event at a time. [`StreamingGrouper`] buffers those events into
//! complete turns with an explicit state machine:
//!
//! ```text
//! Idle -> Accumulating -> AwaitingToolResults -> Finalizing -> Idle
//! ```
//!
//! Turns are built with the same [`Turn`] primitives as the batch reconstructor, so a transcript
//! grouped live renders exactly like the same transcript imported from its log file.

use crate::record::{LogEntry, LogRecord, ResultEvent, StreamEvent};
use crate::thread::Turn;
use crate::types::{Role, SessionId};

/// A finalized live turn, ready to be stored.
pub type GroupedMessage = Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    #[default]
    Idle,
    Accumulating,
    AwaitingToolResults,
    Finalizing,
}

/// Groups one live session's events into turns.
#[derive(Debug, Default)]
pub struct StreamingGrouper {
    state: GroupState,
    current: Option<Turn>,
    session_id: Option<SessionId>,
    model: Option<String>,
    completion: Option<ResultEvent>,
}

impl StreamingGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn state(&self) -> GroupState {
        self.state
    }

    /// Session id announced by the stream, if any.
    pub const fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// The completion event, once the stream has sent one.
    pub const fn completion(&self) -> Option<&ResultEvent> {
        self.completion.as_ref()
    }

    /// Feeds one event and returns any turns it finalized, in order.
    pub fn push(&mut self, event: StreamEvent) -> Vec<GroupedMessage> {
        match event {
            StreamEvent::Init {
                session_id, model, ..
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if model.is_some() {
                    self.model = model;
                }
                Vec::new()
            }
            StreamEvent::Result(result) => {
                if self.session_id.is_none() {
                    self.session_id.clone_from(&result.session_id);
                }
                self.completion = Some(result);
                self.finalize().into_iter().collect()
            }
            StreamEvent::Entry(LogEntry::Summary(summary)) => {
                tracing::debug!(title = %summary.title, "ignoring summary on live stream");
                Vec::new()
            }
            StreamEvent::Entry(LogEntry::Message(record)) => {
                if self.session_id.is_none() {
                    self.session_id = Some(record.session_id.clone());
                }
                self.push_record(&record)
            }
        }
    }

    fn push_record(&mut self, record: &LogRecord) -> Vec<GroupedMessage> {
        match record.role() {
            Role::Assistant => {
                match self.current.as_mut() {
                    Some(turn) => turn.append(record),
                    None => self.current = Some(Turn::start(record)),
                }
                self.state = if self.current.as_ref().is_some_and(Turn::is_awaiting_tools) {
                    GroupState::AwaitingToolResults
                } else {
                    GroupState::Accumulating
                };
                Vec::new()
            }
            Role::User if record.is_tool_result() && self.owns_tool_result(record) => {
                let Some(turn) = self.current.as_mut() else {
                    return Vec::new();
                };
                turn.append(record);
                if turn.is_awaiting_tools() {
                    Vec::new()
                } else {
                    self.finalize().into_iter().collect()
                }
            }
            Role::User => {
                // Prompts and orphan tool results both end the current turn and stand alone.
                let mut finished: Vec<GroupedMessage> = self.finalize().into_iter().collect();
                let mut standalone = Turn::start(record);
                standalone.open = false;
                finished.push(standalone);
                finished
            }
        }
    }

    fn owns_tool_result(&self, record: &LogRecord) -> bool {
        self.state == GroupState::AwaitingToolResults
            && self.current.as_ref().is_some_and(|turn| {
                record
                    .tool_result_ids()
                    .iter()
                    .any(|id| turn.pending_tool_ids.contains(*id))
            })
    }

    /// Closes the in-flight turn, if there is one, and returns to `Idle`.
    fn finalize(&mut self) -> Option<GroupedMessage> {
        self.state = GroupState::Finalizing;
        let turn = self.current.take().map(|mut turn| {
            turn.open = false;
            turn
        });
        self.state = GroupState::Idle;
        turn
    }

    /// Emits whatever is still buffered, for when the stream ends without a result event.
    pub fn flush(&mut self) -> Option<GroupedMessage> {
        self.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::record::parse_stream_event;
    use crate::thread::reconstruct;
    use crate::thread::tests::{assistant_text, assistant_tool, tool_result, user};
    use chrono::Utc;

    fn entry(record: LogRecord) -> StreamEvent {
        StreamEvent::Entry(LogEntry::Message(record))
    }

    fn result_event() -> StreamEvent {
        parse_stream_event(
            r#"{"type":"result","subtype":"success","is_error":false,"session_id":"s1"}"#,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn tool_round_trip_walks_every_state() {
        let mut grouper = StreamingGrouper::new();
        assert_eq!(grouper.state(), GroupState::Idle);

        let prompt = grouper.push(entry(user("u1", None, "2025-03-01T10:00:00Z", "please fix")));
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].role, Role::User);
        assert_eq!(grouper.state(), GroupState::Idle);

        let emitted = grouper.push(entry(assistant_text("a0", "u1", "2025-03-01T10:00:01Z", "Hmm.")));
        assert!(emitted.is_empty());
        assert_eq!(grouper.state(), GroupState::Accumulating);

        let emitted = grouper.push(entry(assistant_tool("a1", "a0", "2025-03-01T10:00:02Z", "T1")));
        assert!(emitted.is_empty());
        assert_eq!(grouper.state(), GroupState::AwaitingToolResults);

        let emitted = grouper.push(entry(tool_result("u2", "a1", "2025-03-01T10:00:03Z", "T1")));
        assert_eq!(grouper.state(), GroupState::Idle);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].record_uuids, vec!["a0", "a1", "u2"]);
        assert!(!emitted[0].open);
        assert_eq!(grouper.session_id().map(SessionId::as_str), Some("s1"));
    }

    #[test]
    fn partial_results_keep_awaiting() {
        let mut grouper = StreamingGrouper::new();
        grouper.push(entry(assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1")));
        grouper.push(entry(assistant_tool("a2", "a1", "2025-03-01T10:00:02Z", "T2")));
        let emitted = grouper.push(entry(tool_result("r1", "a2", "2025-03-01T10:00:03Z", "T1")));
        assert!(emitted.is_empty());
        assert_eq!(grouper.state(), GroupState::AwaitingToolResults);

        let emitted = grouper.push(entry(tool_result("r2", "r1", "2025-03-01T10:00:04Z", "T2")));
        assert_eq!(emitted.len(), 1);
        assert_eq!(grouper.state(), GroupState::Idle);
    }

    #[test]
    fn result_event_forces_finalize_from_any_state() {
        let mut grouper = StreamingGrouper::new();
        grouper.push(entry(assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1")));
        let emitted = grouper.push(result_event());
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].pending_tool_ids.contains("T1"));
        assert_eq!(grouper.state(), GroupState::Idle);
        assert!(grouper.completion().is_some());

        assert!(grouper.push(result_event()).is_empty());
    }

    #[test]
    fn orphan_tool_result_becomes_standalone_turn() {
        let mut grouper = StreamingGrouper::new();
        grouper.push(entry(assistant_text("a1", "u1", "2025-03-01T10:00:01Z", "done")));
        let emitted = grouper.push(entry(tool_result("r1", "a1", "2025-03-01T10:00:02Z", "T404")));
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].record_uuids, vec!["a1"]);
        assert_eq!(emitted[1].record_uuids, vec!["r1"]);
        assert_eq!(emitted[1].rendered(), "total 0");
    }

    #[test]
    fn init_event_records_session_and_model() {
        let mut grouper = StreamingGrouper::new();
        let init = parse_stream_event(
            r#"{"type":"system","subtype":"init","session_id":"live-1","model":"claude-sonnet-4"}"#,
            Utc::now(),
        )
        .unwrap();
        assert!(grouper.push(init).is_empty());
        assert_eq!(grouper.session_id().map(SessionId::as_str), Some("live-1"));
        assert_eq!(grouper.model(), Some("claude-sonnet-4"));
        assert!(grouper.flush().is_none());
    }

    #[test]
    fn live_grouping_matches_batch_reconstruction() {
        let records = vec![
            user("u1", None, "2025-03-01T10:00:00Z", "please fix"),
            assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1"),
            tool_result("u2", "a1", "2025-03-01T10:00:02Z", "T1"),
            assistant_text("a2", "u2", "2025-03-01T10:00:03Z", "Fixed it."),
            user("u3", Some("a2"), "2025-03-01T10:00:04Z", "thanks"),
            assistant_text("a3", "u3", "2025-03-01T10:00:05Z", "Anytime."),
            assistant_tool("a4", "a3", "2025-03-01T10:00:06Z", "T4"),
            user("u4", Some("a4"), "2025-03-01T10:00:07Z", "stop"),
            tool_result("r4", "u4", "2025-03-01T10:00:08Z", "T4"),
        ];

        let batch = reconstruct(SessionId::new("s1").unwrap(), records.clone());

        let mut grouper = StreamingGrouper::new();
        let mut live = Vec::new();
        for record in records {
            live.extend(grouper.push(entry(record)));
        }
        live.extend(grouper.push(result_event()));

        let render = |turns: &[Turn]| -> Vec<(Role, Vec<String>, String)> {
            turns
                .iter()
                .map(|t| (t.role, t.record_uuids.clone(), t.rendered()))
                .collect()
        };
        assert_eq!(render(&live), render(&batch.turns));
        assert_eq!(live.last().map(|t| t.record_uuids.clone()), Some(vec!["r4".to_string()]));
        for (l, b) in live.iter().zip(&batch.turns) {
            assert_eq!(l.segments, b.segments);
        }
    }
}
