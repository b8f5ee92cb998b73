//! Thread reconstruction for the batch path.
//!
//! Records are ordered root to leaf along `parentUuid` edges and then folded into [`Turn`]s.
//! Tool results are attached to the turn that issued the matching `tool_use`, so reasoning, the
//! tool call and its output end up in one block.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{self, ContentSegment};
use crate::record::LogRecord;
use crate::types::{Role, SessionId};

/// One coherent exchange unit, rendered as a single block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Uuid of the first record in the turn. Stable across passes.
    pub id: String,
    pub session_id: SessionId,
    pub role: Role,
    pub started_at: DateTime<Utc>,
    pub record_uuids: Vec<String>,
    pub segments: Vec<ContentSegment>,
    /// `tool_use` ids issued by this turn that have no result yet.
    pub pending_tool_ids: BTreeSet<String>,
    /// Whether later records may still be appended.
    pub open: bool,
}

impl Turn {
    /// Starts a turn from its first record.
    pub fn start(record: &LogRecord) -> Self {
        let mut turn = Self {
            id: record.uuid.clone(),
            session_id: record.session_id.clone(),
            role: record.role(),
            started_at: record.timestamp,
            record_uuids: Vec::new(),
            segments: Vec::new(),
            pending_tool_ids: BTreeSet::new(),
            open: record.role() == Role::Assistant,
        };
        turn.append(record);
        turn
    }

    /// Adds a record's segments and updates outstanding tool calls.
    pub fn append(&mut self, record: &LogRecord) {
        self.record_uuids.push(record.uuid.clone());
        self.segments
            .extend(content::extract(record.kind, record.content()));
        for id in record.tool_use_ids() {
            self.pending_tool_ids.insert(id.to_string());
        }
        for id in record.tool_result_ids() {
            self.pending_tool_ids.remove(id);
        }
    }

    pub fn is_awaiting_tools(&self) -> bool {
        !self.pending_tool_ids.is_empty()
    }

    /// The canonical text of this turn.
    pub fn rendered(&self) -> String {
        content::render_segments(&self.segments)
    }
}

/// Ordered records and turns of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationThread {
    pub session_id: SessionId,
    pub records: Vec<LogRecord>,
    pub turns: Vec<Turn>,
}

/// Reconstructs a single session's thread from scratch.
pub fn reconstruct(session_id: SessionId, records: Vec<LogRecord>) -> ConversationThread {
    let records = order_records(records);
    let mut reconstructor = ThreadReconstructor::new();
    for record in &records {
        reconstructor.push(record);
    }
    ConversationThread {
        session_id,
        records,
        turns: reconstructor.finish(),
    }
}

/// Splits records by session, keeping file order within each.
pub fn partition_by_session(records: Vec<LogRecord>) -> BTreeMap<SessionId, Vec<LogRecord>> {
    let mut sessions: BTreeMap<SessionId, Vec<LogRecord>> = BTreeMap::new();
    for record in records {
        sessions
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
    }
    sessions
}

/// Orders records depth-first from each root, siblings by `(timestamp, uuid)`.
///
/// A record whose parent is missing from `records` becomes a root. Duplicate uuids keep the
/// first occurrence. Records caught in a parent cycle are emitted starting from the earliest one.
pub fn order_records(records: Vec<LogRecord>) -> Vec<LogRecord> {
    let mut seen = BTreeSet::new();
    let records: Vec<LogRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.uuid.clone()))
        .collect();

    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.uuid.as_str(), i))
        .collect();

    let sort_key = |i: &usize| (records[*i].timestamp, records[*i].uuid.as_str());

    let mut roots = Vec::new();
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        match record.parent_uuid.as_deref().and_then(|p| index.get(p)) {
            Some(&parent) if parent != i => children.entry(parent).or_default().push(i),
            _ => roots.push(i),
        }
    }
    roots.sort_by_key(sort_key);
    for siblings in children.values_mut() {
        siblings.sort_by_key(sort_key);
    }

    let mut visited = vec![false; records.len()];
    let mut order = Vec::with_capacity(records.len());
    let walk = |start: usize, visited: &mut [bool], order: &mut Vec<usize>| {
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            order.push(i);
            if let Some(kids) = children.get(&i) {
                stack.extend(kids.iter().rev().copied());
            }
        }
    };

    for &root in &roots {
        walk(root, &mut visited, &mut order);
    }

    let mut leftovers: Vec<usize> = (0..records.len()).filter(|&i| !visited[i]).collect();
    leftovers.sort_by_key(sort_key);
    for i in leftovers {
        walk(i, &mut visited, &mut order);
    }

    let mut slots: Vec<Option<LogRecord>> = records.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Folds ordered records into turns.
///
/// Turns left open by a previous pass can be resumed so that records appended to the log later
/// continue them instead of starting new ones.
#[derive(Debug, Default)]
pub struct ThreadReconstructor {
    turns: Vec<Turn>,
    /// Index of the assistant turn currently accepting records.
    current: Option<usize>,
    tool_owners: HashMap<String, usize>,
}

impl ThreadReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues from turns that were still open at the end of an earlier pass.
    pub fn resume(open_turns: Vec<Turn>) -> Self {
        let mut reconstructor = Self::new();
        for turn in open_turns {
            let index = reconstructor.turns.len();
            for id in &turn.pending_tool_ids {
                reconstructor.tool_owners.insert(id.clone(), index);
            }
            if turn.open && turn.role == Role::Assistant {
                reconstructor.current = Some(index);
            }
            reconstructor.turns.push(turn);
        }
        reconstructor
    }

    pub fn push(&mut self, record: &LogRecord) {
        match record.role() {
            Role::Assistant => self.push_assistant(record),
            Role::User if record.is_tool_result() => self.push_tool_result(record),
            Role::User => {
                self.close_current();
                self.turns.push(Turn::start(record));
            }
        }
    }

    fn push_assistant(&mut self, record: &LogRecord) {
        let index = match self.current {
            Some(index) if self.turns[index].open => {
                self.turns[index].append(record);
                index
            }
            _ => {
                self.turns.push(Turn::start(record));
                self.turns.len() - 1
            }
        };
        for id in record.tool_use_ids() {
            self.tool_owners.insert(id.to_string(), index);
        }
        self.current = Some(index);
    }

    fn push_tool_result(&mut self, record: &LogRecord) {
        // Only a turn still open and waiting on this id may take the result.
        let owner = record.tool_result_ids().into_iter().find_map(|id| {
            self.tool_owners.get(id).copied().filter(|&index| {
                let turn = &self.turns[index];
                turn.open && turn.pending_tool_ids.contains(id)
            })
        });

        let Some(index) = owner else {
            tracing::debug!(uuid = %record.uuid, "tool result without an open matching tool call");
            self.close_current();
            self.turns.push(Turn::start(record));
            return;
        };

        let turn = &mut self.turns[index];
        turn.append(record);
        if !turn.is_awaiting_tools() && turn.open {
            turn.open = false;
            if self.current == Some(index) {
                self.current = None;
            }
        }
    }

    fn close_current(&mut self) {
        if let Some(index) = self.current.take() {
            self.turns[index].open = false;
        }
    }

    /// All turns, resumed ones first, in the order they were started.
    pub fn finish(self) -> Vec<Turn> {
        self.turns
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::record::{LogEntry, parse};

    pub(crate) fn record(line: &str) -> LogRecord {
        match parse(line).unwrap() {
            LogEntry::Message(record) => record,
            LogEntry::Summary(_) => panic!("expected a message line"),
        }
    }

    pub(crate) fn user(uuid: &str, parent: Option<&str>, ts: &str, text: &str) -> LogRecord {
        let parent = parent.map_or_else(|| "null".to_string(), |p| format!("\"{p}\""));
        record(&format!(
            r#"{{"type":"user","uuid":"{uuid}","parentUuid":{parent},"sessionId":"s1","timestamp":"{ts}","message":{{"role":"user","content":"{text}"}}}}"#
        ))
    }

    pub(crate) fn assistant_tool(uuid: &str, parent: &str, ts: &str, tool_id: &str) -> LogRecord {
        record(&format!(
            r#"{{"type":"assistant","uuid":"{uuid}","parentUuid":"{parent}","sessionId":"s1","timestamp":"{ts}","message":{{"id":"msg_{uuid}","role":"assistant","content":[{{"type":"text","text":"Let me look."}},{{"type":"tool_use","id":"{tool_id}","name":"Bash","input":{{"command":"ls -la"}}}}]}}}}"#
        ))
    }

    pub(crate) fn assistant_text(uuid: &str, parent: &str, ts: &str, text: &str) -> LogRecord {
        record(&format!(
            r#"{{"type":"assistant","uuid":"{uuid}","parentUuid":"{parent}","sessionId":"s1","timestamp":"{ts}","message":{{"id":"msg_{uuid}","role":"assistant","content":[{{"type":"text","text":"{text}"}}]}}}}"#
        ))
    }

    pub(crate) fn tool_result(uuid: &str, parent: &str, ts: &str, tool_id: &str) -> LogRecord {
        record(&format!(
            r#"{{"type":"user","uuid":"{uuid}","parentUuid":"{parent}","sessionId":"s1","timestamp":"{ts}","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"{tool_id}","content":"total 0"}}]}}}}"#
        ))
    }

    fn sid() -> SessionId {
        SessionId::new("s1").unwrap()
    }

    fn uuids(records: &[LogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.uuid.as_str()).collect()
    }

    #[test]
    fn orders_root_to_leaf_regardless_of_file_order() {
        let records = vec![
            tool_result("u2", "a1", "2025-03-01T10:00:02Z", "T1"),
            assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1"),
            user("u1", None, "2025-03-01T10:00:00Z", "please fix"),
        ];
        assert_eq!(uuids(&order_records(records)), vec!["u1", "a1", "u2"]);
    }

    #[test]
    fn siblings_break_ties_by_timestamp_then_uuid() {
        let records = vec![
            user("root", None, "2025-03-01T10:00:00Z", "go"),
            assistant_text("b", "root", "2025-03-01T10:00:05Z", "second"),
            assistant_text("z", "root", "2025-03-01T10:00:01Z", "first"),
            assistant_text("a", "root", "2025-03-01T10:00:05Z", "tie"),
        ];
        assert_eq!(uuids(&order_records(records)), vec!["root", "z", "a", "b"]);
    }

    #[test]
    fn unresolvable_parent_becomes_a_root() {
        let records = vec![
            user("u1", None, "2025-03-01T10:00:00Z", "hi"),
            assistant_text("orphan", "gone", "2025-03-01T09:00:00Z", "still here"),
        ];
        let ordered = order_records(records);
        assert_eq!(uuids(&ordered), vec!["orphan", "u1"]);
    }

    #[test]
    fn cycles_and_duplicates_do_not_lose_records() {
        let records = vec![
            assistant_text("x", "y", "2025-03-01T10:00:01Z", "x"),
            assistant_text("y", "x", "2025-03-01T10:00:00Z", "y"),
            assistant_text("y", "x", "2025-03-01T10:00:00Z", "dup"),
        ];
        assert_eq!(uuids(&order_records(records)), vec!["y", "x"]);
    }

    #[test]
    fn tool_use_and_result_form_one_turn() {
        let thread = reconstruct(
            sid(),
            vec![
                user("u1", None, "2025-03-01T10:00:00Z", "please fix"),
                assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1"),
                tool_result("u2", "a1", "2025-03-01T10:00:02Z", "T1"),
            ],
        );
        assert_eq!(thread.turns.len(), 2);
        let turn = &thread.turns[1];
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.record_uuids, vec!["a1", "u2"]);
        assert!(!turn.open);
        assert_eq!(
            turn.rendered(),
            "Let me look.\n\nUsed Bash — command: ls -la\n\ntotal 0"
        );
    }

    #[test]
    fn results_attach_by_tool_id_not_parent() {
        let thread = reconstruct(
            sid(),
            vec![
                user("u1", None, "2025-03-01T10:00:00Z", "go"),
                assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1"),
                assistant_tool("a2", "a1", "2025-03-01T10:00:02Z", "T2"),
                tool_result("r2", "a2", "2025-03-01T10:00:03Z", "T2"),
                tool_result("r1", "r2", "2025-03-01T10:00:04Z", "T1"),
            ],
        );
        assert_eq!(thread.turns.len(), 2);
        assert_eq!(thread.turns[1].record_uuids, vec!["a1", "a2", "r2", "r1"]);
        assert!(!thread.turns[1].open);
    }

    #[test]
    fn orphan_tool_result_is_a_standalone_turn() {
        let thread = reconstruct(
            sid(),
            vec![tool_result("r1", "missing", "2025-03-01T10:00:00Z", "T9")],
        );
        assert_eq!(thread.turns.len(), 1);
        assert_eq!(thread.turns[0].role, Role::User);
        assert_eq!(thread.turns[0].rendered(), "total 0");
    }

    #[test]
    fn user_text_closes_the_open_assistant_turn() {
        let thread = reconstruct(
            sid(),
            vec![
                user("u1", None, "2025-03-01T10:00:00Z", "hi"),
                assistant_text("a1", "u1", "2025-03-01T10:00:01Z", "hello"),
                assistant_text("a2", "a1", "2025-03-01T10:00:02Z", "anything else?"),
                user("u2", Some("a2"), "2025-03-01T10:00:03Z", "no"),
            ],
        );
        let roles: Vec<Role> = thread.turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(thread.turns[1].record_uuids, vec!["a1", "a2"]);
        assert!(thread.turns.iter().all(|t| !t.open));
    }

    #[test]
    fn tool_result_after_prompt_stands_alone() {
        let thread = reconstruct(
            sid(),
            vec![
                user("u1", None, "2025-03-01T10:00:00Z", "go"),
                assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1"),
                user("u2", Some("a1"), "2025-03-01T10:00:02Z", "stop"),
                tool_result("r1", "u2", "2025-03-01T10:00:03Z", "T1"),
            ],
        );
        let ids: Vec<Vec<String>> = thread.turns.iter().map(|t| t.record_uuids.clone()).collect();
        assert_eq!(ids, vec![vec!["u1"], vec!["a1"], vec!["u2"], vec!["r1"]]);
        assert_eq!(thread.turns[3].role, Role::User);
        assert!(thread.turns.iter().all(|t| !t.open));
    }

    #[test]
    fn resumed_turn_receives_late_tool_result() {
        let first = reconstruct(
            sid(),
            vec![
                user("u1", None, "2025-03-01T10:00:00Z", "go"),
                assistant_tool("a1", "u1", "2025-03-01T10:00:01Z", "T1"),
            ],
        );
        let open: Vec<Turn> = first.turns.into_iter().filter(|t| t.open).collect();
        assert_eq!(open.len(), 1);
        assert!(open[0].pending_tool_ids.contains("T1"));

        let mut reconstructor = ThreadReconstructor::resume(open);
        reconstructor.push(&tool_result("u2", "a1", "2025-03-01T10:00:02Z", "T1"));
        let turns = reconstructor.finish();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].id, "a1");
        assert_eq!(turns[0].record_uuids, vec!["a1", "u2"]);
        assert!(!turns[0].open);
    }
}
