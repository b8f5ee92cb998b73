//! Storage layer for threadline.
//!
//! Provides persistence for sessions, turns and sync cursors using `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! The sync engine shares one instance behind a `Mutex` and only touches it from blocking tasks.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in ISO 8601 format with millisecond precision
//! (e.g., `2025-03-01T10:00:00.000Z`). The fixed width keeps lexicographic and chronological
//! ordering identical, which the session upsert relies on for `MIN`/`MAX`.
//!
//! ## Tables
//!
//! - `sessions`: one row per `session_id`, enforced by the primary key.
//! - `messages`: rendered turns. `segments` holds the JSON segment list, `content` the rendered
//!   text. Turns still open at the end of a pass keep their outstanding tool ids so a later pass
//!   can resume them.
//! - `records`: the uuid of every log record already stored. This is the existence check that
//!   makes re-reading a file (or reading a file after the live path stored the same turns) a no-op.
//! - `sync_cursors`: how far each log file has been consumed.
//!
//! Raw log lines are never stored.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde::Serialize;
use thiserror::Error;
use tl_core::{ContentSegment, FileSignature, Role, SessionId, Turn, ValidationError};

/// Title shown for sessions with neither a summary nor a user prompt.
pub const UNTITLED_SESSION: &str = "Untitled session";

/// How long a writer waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of bound parameters per existence query.
const LOOKUP_CHUNK: usize = 500;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to encode or decode a JSON column.
    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp in {table}: {timestamp}")]
    TimestampParse {
        table: &'static str,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored id or role failed validation.
    #[error("invalid stored value: {0}")]
    Invalid(#[from] ValidationError),
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A session as exposed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub title: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: i64,
    pub cost_usd: f64,
}

/// A stored turn as exposed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: SessionId,
    pub role: Role,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub segments: Vec<ContentSegment>,
    pub content: String,
}

/// How far a log file has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub file_path: String,
    pub last_line_number: u64,
    /// Byte offset just past the last consumed line.
    pub byte_offset: u64,
    pub signature: FileSignature,
}

/// Session-level facts gathered from one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub session_id: SessionId,
    /// Title from a `summary` record. Always wins.
    pub summary_title: Option<String>,
    /// Title derived from the first user prompt. Used only when no title exists yet.
    pub fallback_title: Option<String>,
    /// First `cwd` seen on the session's records.
    pub project_path: Option<String>,
    /// Project directory name, used when no `cwd` is ever seen.
    pub project_dir: Option<String>,
    pub first_activity: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Identity of one consumed log record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    pub uuid: String,
    pub session_id: SessionId,
    /// Id of the turn the record belongs to.
    pub message_id: String,
    pub api_message_id: Option<String>,
    pub cost_usd: f64,
    pub is_sidechain: bool,
}

/// Everything one sync pass writes, committed atomically by [`Database::commit_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    pub sessions: Vec<SessionUpdate>,
    /// New turns and resumed turns that changed.
    pub turns: Vec<Turn>,
    pub records: Vec<RecordRow>,
    /// Advanced only if the rest of the batch commits.
    pub cursor: Option<SyncCursor>,
}

/// Row counts written by a committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub inserted: usize,
    pub updated: usize,
}

/// Table sizes for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub sessions: i64,
    pub messages: i64,
    pub records: i64,
    pub cursors: i64,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open. File databases use WAL
    /// so readers are not blocked while a sync pass commits.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                title TEXT,
                project_path TEXT,
                project_dir TEXT,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(last_activity);

            -- One row per turn. id is the uuid of the turn's first record.
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                position INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                segments TEXT NOT NULL,
                content TEXT NOT NULL,
                record_uuids TEXT NOT NULL,
                pending_tool_ids TEXT NOT NULL DEFAULT '[]',
                is_open INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, position);

            CREATE TABLE IF NOT EXISTS records (
                uuid TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                api_message_id TEXT,
                cost_usd REAL NOT NULL DEFAULT 0,
                is_sidechain INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_records_session ON records(session_id);

            CREATE TABLE IF NOT EXISTS sync_cursors (
                file_path TEXT PRIMARY KEY,
                last_line_number INTEGER NOT NULL,
                byte_offset INTEGER NOT NULL,
                size INTEGER NOT NULL,
                mtime_ms INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Writes one sync pass in a single transaction.
    ///
    /// Sessions are merged by `session_id`, never duplicated. Any failure rolls back everything,
    /// including the cursor, so the same batch can be retried in full.
    pub fn commit_batch(&mut self, batch: &SyncBatch) -> Result<CommitStats, DbError> {
        let tx = self.conn.transaction()?;
        match write_batch(&tx, batch) {
            Ok(stats) => {
                tx.commit()?;
                tracing::debug!(
                    inserted = stats.inserted,
                    updated = stats.updated,
                    records = batch.records.len(),
                    "committed sync batch"
                );
                Ok(stats)
            }
            Err(e) => {
                tracing::warn!(error = %e, "rolling back sync batch");
                Err(e)
            }
        }
    }

    /// Lists sessions, most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SESSION_SELECT} ORDER BY last_activity DESC, session_id ASC"
        ))?;
        let rows = stmt.query_map([], session_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_record()?);
        }
        Ok(sessions)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!("{SESSION_SELECT} WHERE session_id = ?"),
                [session_id.as_str()],
                session_row,
            )
            .optional()?;
        row.map(SessionRow::into_record).transpose()
    }

    /// Stored turns of a session in display order.
    pub fn get_messages(&self, session_id: &SessionId) -> Result<Vec<StoredMessage>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, session_id, role, position, created_at, segments, content
            FROM messages
            WHERE session_id = ?
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([session_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, session_id, role, position, created_at, segments, content) = row?;
            messages.push(StoredMessage {
                id,
                session_id: SessionId::new(session_id)?,
                role: role.parse()?,
                position,
                created_at: parse_timestamp(&created_at, "messages")?,
                segments: serde_json::from_str(&segments)?,
                content,
            });
        }
        Ok(messages)
    }

    /// Turns of a session that a later pass may still extend.
    pub fn open_turns(&self, session_id: &SessionId) -> Result<Vec<Turn>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, role, created_at, record_uuids, segments, pending_tool_ids
            FROM messages
            WHERE session_id = ? AND is_open = 1
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([session_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut turns = Vec::new();
        for row in rows {
            let (id, role, created_at, record_uuids, segments, pending) = row?;
            turns.push(Turn {
                id,
                session_id: session_id.clone(),
                role: role.parse()?,
                started_at: parse_timestamp(&created_at, "messages")?,
                record_uuids: serde_json::from_str(&record_uuids)?,
                segments: serde_json::from_str(&segments)?,
                pending_tool_ids: serde_json::from_str(&pending)?,
                open: true,
            });
        }
        Ok(turns)
    }

    /// Which of `uuids` are already stored.
    pub fn existing_record_uuids(&self, uuids: &[&str]) -> Result<HashSet<String>, DbError> {
        let mut existing = HashSet::new();
        for chunk in uuids.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT uuid FROM records WHERE uuid IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                existing.insert(row?);
            }
        }
        Ok(existing)
    }

    /// The session that owns a stored record, used to attribute summaries.
    pub fn session_for_record(&self, uuid: &str) -> Result<Option<SessionId>, DbError> {
        let session = self
            .conn
            .query_row(
                "SELECT session_id FROM records WHERE uuid = ?",
                [uuid],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(session.map(SessionId::new).transpose()?)
    }

    pub fn get_cursor(&self, file_path: &str) -> Result<Option<SyncCursor>, DbError> {
        let cursor = self
            .conn
            .query_row(
                "
                SELECT file_path, last_line_number, byte_offset, size, mtime_ms
                FROM sync_cursors
                WHERE file_path = ?
                ",
                [file_path],
                |row| {
                    Ok(SyncCursor {
                        file_path: row.get(0)?,
                        last_line_number: row.get(1)?,
                        byte_offset: row.get(2)?,
                        signature: FileSignature {
                            size: row.get(3)?,
                            mtime_ms: row.get(4)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    pub fn stats(&self) -> Result<StoreStats, DbError> {
        let count = |table: &str| -> Result<i64, DbError> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };
        Ok(StoreStats {
            sessions: count("sessions")?,
            messages: count("messages")?,
            records: count("records")?,
            cursors: count("sync_cursors")?,
        })
    }
}

const SESSION_SELECT: &str = "
    SELECT session_id, title, COALESCE(project_path, project_dir, ''), created_at, last_activity,
           message_count, cost_usd
    FROM sessions";

struct SessionRow {
    session_id: String,
    title: Option<String>,
    project_path: String,
    created_at: String,
    last_activity: String,
    message_count: i64,
    cost_usd: f64,
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session_id: row.get(0)?,
        title: row.get(1)?,
        project_path: row.get(2)?,
        created_at: row.get(3)?,
        last_activity: row.get(4)?,
        message_count: row.get(5)?,
        cost_usd: row.get(6)?,
    })
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord, DbError> {
        Ok(SessionRecord {
            session_id: SessionId::new(self.session_id)?,
            title: self.title.unwrap_or_else(|| UNTITLED_SESSION.to_string()),
            project_path: self.project_path,
            created_at: parse_timestamp(&self.created_at, "sessions")?,
            last_activity: parse_timestamp(&self.last_activity, "sessions")?,
            message_count: self.message_count,
            cost_usd: self.cost_usd,
        })
    }
}

/// Applies every write of one batch. The caller owns the transaction.
fn write_batch(tx: &Transaction<'_>, batch: &SyncBatch) -> Result<CommitStats, DbError> {
    let mut stats = CommitStats::default();

    for session in &batch.sessions {
        upsert_session(tx, session)?;
    }

    for turn in &batch.turns {
        if upsert_turn(tx, turn)? {
            stats.inserted += 1;
        } else {
            stats.updated += 1;
        }
    }

    {
        let mut stmt = tx.prepare(
            "
            INSERT OR IGNORE INTO records
            (uuid, session_id, message_id, api_message_id, cost_usd, is_sidechain)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )?;
        for record in &batch.records {
            stmt.execute(params![
                record.uuid,
                record.session_id.as_str(),
                record.message_id,
                record.api_message_id,
                record.cost_usd,
                record.is_sidechain,
            ])?;
        }
    }

    let touched: BTreeSet<&str> = batch
        .sessions
        .iter()
        .map(|s| s.session_id.as_str())
        .chain(batch.turns.iter().map(|t| t.session_id.as_str()))
        .collect();
    for session_id in touched {
        renumber_turns(tx, session_id)?;
        refresh_session_totals(tx, session_id)?;
    }

    if let Some(cursor) = &batch.cursor {
        save_cursor(tx, cursor)?;
    }

    Ok(stats)
}

fn upsert_session(tx: &Transaction<'_>, session: &SessionUpdate) -> Result<(), DbError> {
    tx.execute(
        "
        INSERT INTO sessions
        (session_id, title, project_path, project_dir, created_at, last_activity)
        VALUES (?1, COALESCE(?2, ?3), ?4, ?5, ?6, ?7)
        ON CONFLICT(session_id) DO UPDATE SET
            title = COALESCE(?2, sessions.title, ?3),
            project_path = COALESCE(sessions.project_path, ?4),
            project_dir = COALESCE(sessions.project_dir, ?5),
            created_at = MIN(sessions.created_at, ?6),
            last_activity = MAX(sessions.last_activity, ?7)
        ",
        params![
            session.session_id.as_str(),
            session.summary_title,
            session.fallback_title,
            session.project_path,
            session.project_dir,
            format_timestamp(session.first_activity),
            format_timestamp(session.last_activity),
        ],
    )?;
    Ok(())
}

/// Inserts or rewrites one turn. Returns `true` when the turn is new.
fn upsert_turn(tx: &Transaction<'_>, turn: &Turn) -> Result<bool, DbError> {
    let exists = tx
        .query_row("SELECT 1 FROM messages WHERE id = ?", [&turn.id], |_| Ok(()))
        .optional()?
        .is_some();

    let segments = serde_json::to_string(&turn.segments)?;
    let record_uuids = serde_json::to_string(&turn.record_uuids)?;
    let pending = serde_json::to_string(&turn.pending_tool_ids)?;

    if exists {
        tx.execute(
            "
            UPDATE messages
            SET segments = ?2, content = ?3, record_uuids = ?4, pending_tool_ids = ?5, is_open = ?6
            WHERE id = ?1
            ",
            params![
                turn.id,
                segments,
                turn.rendered(),
                record_uuids,
                pending,
                turn.open
            ],
        )?;
    } else {
        tx.execute(
            "
            INSERT INTO messages
            (id, session_id, role, position, created_at, segments, content, record_uuids,
             pending_tool_ids, is_open)
            VALUES (?1, ?2, ?3,
                    (SELECT COALESCE(MAX(position) + 1, 0) FROM messages WHERE session_id = ?2),
                    ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                turn.id,
                turn.session_id.as_str(),
                turn.role.as_str(),
                format_timestamp(turn.started_at),
                segments,
                turn.rendered(),
                record_uuids,
                pending,
                turn.open,
            ],
        )?;
    }
    Ok(!exists)
}

/// Rewrites `position` so turns read in conversation order.
///
/// Turns are ordered by start time. Ties keep their previous relative order, so a turn that was
/// stored early by the live path moves behind a prompt imported later from the log file.
fn renumber_turns(tx: &Transaction<'_>, session_id: &str) -> Result<(), DbError> {
    let ids = {
        let mut stmt = tx.prepare(
            "
            SELECT id FROM messages
            WHERE session_id = ?
            ORDER BY created_at ASC, position ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let mut stmt = tx.prepare("UPDATE messages SET position = ?1 WHERE id = ?2 AND position != ?1")?;
    for (position, id) in (0_i64..).zip(&ids) {
        stmt.execute(params![position, id])?;
    }
    Ok(())
}

/// Recomputes counters from stored rows. Records that share an API message id carry the same
/// usage, so each API message is costed once.
fn refresh_session_totals(tx: &Transaction<'_>, session_id: &str) -> Result<(), DbError> {
    tx.execute(
        "
        UPDATE sessions SET
            message_count = (SELECT COUNT(*) FROM messages WHERE session_id = ?1),
            cost_usd = (
                SELECT COALESCE(SUM(cost), 0) FROM (
                    SELECT MAX(cost_usd) AS cost
                    FROM records
                    WHERE session_id = ?1
                    GROUP BY COALESCE(api_message_id, uuid)
                )
            )
        WHERE session_id = ?1
        ",
        [session_id],
    )?;
    Ok(())
}

fn save_cursor(tx: &Transaction<'_>, cursor: &SyncCursor) -> Result<(), DbError> {
    tx.execute(
        "
        INSERT INTO sync_cursors (file_path, last_line_number, byte_offset, size, mtime_ms, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(file_path) DO UPDATE SET
            last_line_number = excluded.last_line_number,
            byte_offset = excluded.byte_offset,
            size = excluded.size,
            mtime_ms = excluded.mtime_ms,
            updated_at = excluded.updated_at
        ",
        params![
            cursor.file_path,
            cursor.last_line_number,
            cursor.byte_offset,
            cursor.signature.size,
            cursor.signature.mtime_ms,
            format_timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

fn parse_timestamp(timestamp: &str, table: &'static str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            table,
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn session(id: &str, summary: Option<&str>, fallback: Option<&str>) -> SessionUpdate {
        SessionUpdate {
            session_id: sid(id),
            summary_title: summary.map(String::from),
            fallback_title: fallback.map(String::from),
            project_path: Some("/home/dev/app".into()),
            project_dir: Some("-home-dev-app".into()),
            first_activity: ts("2025-03-01T10:00:00Z"),
            last_activity: ts("2025-03-01T10:05:00Z"),
        }
    }

    fn turn(id: &str, session_id: &str, role: Role, text: &str, open: bool) -> Turn {
        Turn {
            id: id.into(),
            session_id: sid(session_id),
            role,
            started_at: ts("2025-03-01T10:00:00Z"),
            record_uuids: vec![id.into()],
            segments: vec![ContentSegment::text(text)],
            pending_tool_ids: BTreeSet::new(),
            open,
        }
    }

    fn record_row(uuid: &str, message_id: &str, api: Option<&str>, cost: f64) -> RecordRow {
        RecordRow {
            uuid: uuid.into(),
            session_id: sid("s1"),
            message_id: message_id.into(),
            api_message_id: api.map(String::from),
            cost_usd: cost,
            is_sidechain: false,
        }
    }

    fn cursor(lines: u64, offset: u64) -> SyncCursor {
        SyncCursor {
            file_path: "/logs/p/s1.jsonl".into(),
            last_line_number: lines,
            byte_offset: offset,
            signature: FileSignature {
                size: offset,
                mtime_ms: 1_700_000_000_000,
            },
        }
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    #[test]
    fn open_file_database_twice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threadline.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");
        assert_eq!(
            table_columns(&db.conn, "sessions"),
            vec![
                "session_id",
                "title",
                "project_path",
                "project_dir",
                "created_at",
                "last_activity",
                "message_count",
                "cost_usd",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "sync_cursors"),
            vec![
                "file_path",
                "last_line_number",
                "byte_offset",
                "size",
                "mtime_ms",
                "updated_at",
            ]
        );
    }

    #[test]
    fn commit_writes_session_turns_records_and_cursor() {
        let mut db = Database::open_in_memory().unwrap();
        let stats = db
            .commit_batch(&SyncBatch {
                sessions: vec![session("s1", Some("Fix bug"), Some("please fix"))],
                turns: vec![
                    turn("u1", "s1", Role::User, "please fix", false),
                    turn("a1", "s1", Role::Assistant, "on it", false),
                ],
                records: vec![record_row("u1", "u1", None, 0.0)],
                cursor: Some(cursor(4, 120)),
            })
            .unwrap();
        assert_eq!(stats, CommitStats { inserted: 2, updated: 0 });

        let sessions = db.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Fix bug");
        assert_eq!(sessions[0].project_path, "/home/dev/app");
        assert_eq!(sessions[0].message_count, 2);

        let messages = db.get_messages(&sid("s1")).unwrap();
        let positions: Vec<i64> = messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1]);
        assert_eq!(messages[1].content, "on it");
        assert_eq!(messages[1].role, Role::Assistant);

        assert_eq!(db.get_cursor("/logs/p/s1.jsonl").unwrap(), Some(cursor(4, 120)));
        assert_eq!(db.session_for_record("u1").unwrap(), Some(sid("s1")));
    }

    #[test]
    fn repeated_upserts_keep_one_session_row() {
        let mut db = Database::open_in_memory().unwrap();
        for _ in 0..5 {
            db.commit_batch(&SyncBatch {
                sessions: vec![session("s1", None, Some("first prompt"))],
                ..SyncBatch::default()
            })
            .unwrap();
        }
        assert_eq!(db.stats().unwrap().sessions, 1);
    }

    #[test]
    fn title_precedence_summary_then_existing_then_fallback() {
        let mut db = Database::open_in_memory().unwrap();
        let commit = |db: &mut Database, update: SessionUpdate| {
            db.commit_batch(&SyncBatch {
                sessions: vec![update],
                ..SyncBatch::default()
            })
            .unwrap();
            db.get_session(&sid("s1")).unwrap().unwrap().title
        };

        assert_eq!(commit(&mut db, session("s1", None, None)), UNTITLED_SESSION);
        assert_eq!(commit(&mut db, session("s1", None, Some("first"))), "first");
        assert_eq!(commit(&mut db, session("s1", None, Some("second"))), "first");
        assert_eq!(commit(&mut db, session("s1", Some("Summary"), Some("x"))), "Summary");
        assert_eq!(commit(&mut db, session("s1", None, Some("later"))), "Summary");
    }

    #[test]
    fn activity_bounds_widen_and_project_path_sticks() {
        let mut db = Database::open_in_memory().unwrap();
        let mut first = session("s1", None, None);
        first.project_path = None;
        db.commit_batch(&SyncBatch {
            sessions: vec![first],
            ..SyncBatch::default()
        })
        .unwrap();
        assert_eq!(
            db.get_session(&sid("s1")).unwrap().unwrap().project_path,
            "-home-dev-app"
        );

        let mut later = session("s1", None, None);
        later.first_activity = ts("2025-03-01T09:00:00Z");
        later.last_activity = ts("2025-03-02T09:00:00Z");
        later.project_path = Some("/srv/other".into());
        db.commit_batch(&SyncBatch {
            sessions: vec![later],
            ..SyncBatch::default()
        })
        .unwrap();

        let stored = db.get_session(&sid("s1")).unwrap().unwrap();
        assert_eq!(stored.created_at, ts("2025-03-01T09:00:00Z"));
        assert_eq!(stored.last_activity, ts("2025-03-02T09:00:00Z"));
        assert_eq!(stored.project_path, "/srv/other");
    }

    #[test]
    fn open_turns_round_trip_and_update_in_place() {
        let mut db = Database::open_in_memory().unwrap();
        let mut open = turn("a1", "s1", Role::Assistant, "calling tool", true);
        open.pending_tool_ids.insert("T1".into());
        db.commit_batch(&SyncBatch {
            sessions: vec![session("s1", None, None)],
            turns: vec![turn("u1", "s1", Role::User, "go", false), open.clone()],
            ..SyncBatch::default()
        })
        .unwrap();

        let resumed = db.open_turns(&sid("s1")).unwrap();
        assert_eq!(resumed, vec![open.clone()]);

        let mut closed = open;
        closed.pending_tool_ids.clear();
        closed.open = false;
        closed.record_uuids.push("r1".into());
        closed.segments.push(ContentSegment::text("done"));
        let stats = db
            .commit_batch(&SyncBatch {
                sessions: vec![session("s1", None, None)],
                turns: vec![closed],
                ..SyncBatch::default()
            })
            .unwrap();
        assert_eq!(stats, CommitStats { inserted: 0, updated: 1 });
        assert!(db.open_turns(&sid("s1")).unwrap().is_empty());

        let messages = db.get_messages(&sid("s1")).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].position, 1);
        assert_eq!(messages[1].content, "calling tool\n\ndone");
    }

    #[test]
    fn late_imported_prompt_sorts_before_earlier_stored_reply() {
        let mut db = Database::open_in_memory().unwrap();
        let mut reply = turn("a1", "s1", Role::Assistant, "on it", false);
        reply.started_at = ts("2025-03-01T10:00:01Z");
        db.commit_batch(&SyncBatch {
            sessions: vec![session("s1", None, None)],
            turns: vec![reply],
            ..SyncBatch::default()
        })
        .unwrap();

        db.commit_batch(&SyncBatch {
            sessions: vec![session("s1", None, None)],
            turns: vec![turn("u1", "s1", Role::User, "please fix", false)],
            ..SyncBatch::default()
        })
        .unwrap();

        let messages = db.get_messages(&sid("s1")).unwrap();
        let order: Vec<(&str, i64)> = messages
            .iter()
            .map(|m| (m.id.as_str(), m.position))
            .collect();
        assert_eq!(order, vec![("u1", 0), ("a1", 1)]);
    }

    #[test]
    fn existing_uuids_are_found_across_chunks() {
        let mut db = Database::open_in_memory().unwrap();
        let rows: Vec<RecordRow> = (0..1200)
            .map(|i| record_row(&format!("r{i}"), "m", None, 0.0))
            .collect();
        db.commit_batch(&SyncBatch {
            records: rows,
            ..SyncBatch::default()
        })
        .unwrap();

        let query: Vec<String> = (1100..1300).map(|i| format!("r{i}")).collect();
        let query: Vec<&str> = query.iter().map(String::as_str).collect();
        let found = db.existing_record_uuids(&query).unwrap();
        assert_eq!(found.len(), 100);
        assert!(found.contains("r1199"));
        assert!(!found.contains("r1200"));
    }

    #[test]
    fn cost_counts_each_api_message_once() {
        let mut db = Database::open_in_memory().unwrap();
        db.commit_batch(&SyncBatch {
            sessions: vec![session("s1", None, None)],
            records: vec![
                record_row("a1", "a1", Some("msg_1"), 0.5),
                record_row("a2", "a1", Some("msg_1"), 0.5),
                record_row("a3", "a3", Some("msg_2"), 0.25),
                record_row("u1", "u1", None, 0.0),
            ],
            ..SyncBatch::default()
        })
        .unwrap();
        let stored = db.get_session(&sid("s1")).unwrap().unwrap();
        assert!((stored.cost_usd - 0.75).abs() < 1e-9);
    }

    #[test]
    fn failed_batch_leaves_cursor_and_rows_untouched() {
        let mut db = Database::open_in_memory().unwrap();
        db.commit_batch(&SyncBatch {
            cursor: Some(cursor(1, 10)),
            ..SyncBatch::default()
        })
        .unwrap();

        db.conn
            .execute_batch(
                "CREATE TRIGGER fail_messages BEFORE INSERT ON messages
                 BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;",
            )
            .unwrap();

        let result = db.commit_batch(&SyncBatch {
            sessions: vec![session("s1", Some("t"), None)],
            turns: vec![turn("u1", "s1", Role::User, "hi", false)],
            records: vec![record_row("u1", "u1", None, 0.0)],
            cursor: Some(cursor(2, 20)),
        });
        assert!(matches!(result, Err(DbError::Sqlite(_))));

        assert_eq!(db.get_cursor("/logs/p/s1.jsonl").unwrap(), Some(cursor(1, 10)));
        assert_eq!(
            db.stats().unwrap(),
            StoreStats {
                sessions: 0,
                messages: 0,
                records: 0,
                cursors: 1,
            }
        );
    }
}
