//! The session sync engine.
//!
//! A pass over one log file:
//! 1. takes the lock of the session named by the file,
//! 2. compares the file signature with the stored cursor and stops if nothing changed,
//! 3. reads only new, newline-terminated lines from the cursor's byte offset,
//! 4. drops records the store already has and rebuilds turns (resuming turns left open),
//! 5. commits sessions, turns, records and the advanced cursor in one transaction.
//!
//! File reads and database work run on blocking threads. The session locks are moved into the
//! blocking commit so they are held until the transaction ends, even if the awaiting pass is
//! cancelled by its timeout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tl_core::content::{self, SegmentType};
use tl_core::record::{self, LogEntry, LogRecord, SummaryRecord};
use tl_core::thread::{ThreadReconstructor, order_records, partition_by_session};
use tl_core::{FileSignature, RecordKind, SessionId, Turn, cost, scan_session_files};
use tl_db::{Database, DbError, RecordRow, SessionUpdate, SyncBatch, SyncCursor};

use crate::error::SyncError;
use crate::lock::SessionLocks;

/// Buffer size for `BufReader` (64KB for large session files).
const BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on concurrent passes during a full scan.
const MAX_CONCURRENT_PASSES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a pass waits for a session lock before giving up.
    pub lock_timeout: Duration,
    /// How long one file pass may run before it is deferred.
    pub pass_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            pass_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a sync pass. `inserted` and `updated` count turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    /// Records already present in the store.
    pub skipped: usize,
    /// Lines that failed to parse.
    pub errors: usize,
}

impl SyncReport {
    pub const fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.skipped == 0 && self.errors == 0
    }
}

impl AddAssign for SyncReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} skipped, {} errors",
            self.inserted, self.updated, self.skipped, self.errors
        )
    }
}

/// Totals of a full scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub files: usize,
    pub failed: usize,
    pub totals: SyncReport,
}

/// Session facts the live path knows but the records don't carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveHints {
    pub title: Option<String>,
    pub project_path: Option<String>,
}

/// Incremental, idempotent writer shared by the watch pipeline and live sessions.
#[derive(Clone)]
pub struct SyncEngine {
    db: Arc<Mutex<Database>>,
    locks: SessionLocks,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            locks: SessionLocks::new(),
            config,
        }
    }

    pub const fn config(&self) -> EngineConfig {
        self.config
    }

    pub const fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// Runs a read against the store on a blocking thread.
    pub async fn query<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, DbError> + Send + 'static,
    {
        let engine = self.clone();
        Ok(tokio::task::spawn_blocking(move || f(&*engine.db())).await??)
    }

    /// Syncs one log file, bounded by the configured pass timeout.
    pub async fn sync(&self, path: &Path) -> Result<SyncReport, SyncError> {
        let limit = self.config.pass_timeout;
        match tokio::time::timeout(limit, self.sync_pass(path.to_path_buf())).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::PassTimeout {
                path: path.to_path_buf(),
                limit,
            }),
        }
    }

    /// Discovers every session file under `root` and syncs each. One failing file never stops
    /// the others; failures are logged and counted.
    pub async fn sync_all(&self, root: &Path) -> Result<ScanReport, SyncError> {
        let scan_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scan_session_files(&scan_root)).await??;

        let mut report = ScanReport {
            files: files.len(),
            ..ScanReport::default()
        };
        let mut tasks = JoinSet::new();
        let mut tally = |joined: (PathBuf, Result<SyncReport, SyncError>)| match joined {
            (_, Ok(pass)) => report.totals += pass,
            (path, Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "sync failed");
                report.failed += 1;
            }
        };

        for file in files {
            if tasks.len() >= MAX_CONCURRENT_PASSES {
                if let Some(joined) = tasks.join_next().await {
                    tally(joined?);
                }
            }
            let engine = self.clone();
            tasks.spawn(async move {
                let result = engine.sync(&file.path).await;
                (file.path, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            tally(joined?);
        }

        tracing::info!(
            files = report.files,
            failed = report.failed,
            totals = %report.totals,
            "full scan complete"
        );
        Ok(report)
    }

    /// Stores a turn finalized by the live path.
    ///
    /// Runs under the same session lock as file passes. A turn whose records are already stored
    /// (because the log file was synced first) is skipped, so the two paths never duplicate.
    pub async fn ingest_live(
        &self,
        turn: Turn,
        records: Vec<LogRecord>,
        hints: LiveHints,
    ) -> Result<SyncReport, SyncError> {
        let guard = self
            .locks
            .acquire(&turn.session_id, self.config.lock_timeout)
            .await?;
        let engine = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            engine.commit_live(turn, &records, hints)
        })
        .await?
    }

    async fn sync_pass(&self, path: PathBuf) -> Result<SyncReport, SyncError> {
        let owner = owner_session(&path)?;
        let owner_guard = self
            .locks
            .acquire(&owner, self.config.lock_timeout)
            .await?;

        let engine = self.clone();
        let read_path = path.clone();
        let pending =
            tokio::task::spawn_blocking(move || engine.read_pass(&read_path, owner)).await??;
        let Some(pending) = pending else {
            tracing::debug!(path = %path.display(), "file unchanged, nothing to sync");
            return Ok(SyncReport::default());
        };

        let others: BTreeSet<&SessionId> = pending
            .records
            .iter()
            .map(|r| &r.session_id)
            .filter(|id| **id != pending.owner)
            .collect();
        let mut guards = vec![owner_guard];
        guards.extend(
            self.locks
                .acquire_all(others, self.config.lock_timeout)
                .await?,
        );

        let engine = self.clone();
        let report = tokio::task::spawn_blocking(move || {
            let _guards = guards;
            engine.commit_pass(pending)
        })
        .await??;

        if report.is_noop() {
            tracing::debug!(path = %path.display(), "no new records");
        } else {
            tracing::info!(path = %path.display(), %report, "synced session log");
        }
        Ok(report)
    }

    /// Reads and parses whatever the cursor has not consumed yet. `None` means unchanged.
    fn read_pass(&self, path: &Path, owner: SessionId) -> Result<Option<PendingPass>, SyncError> {
        let io = |source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        };
        let signature = FileSignature::of(path).map_err(io)?;
        let file_key = path.to_string_lossy().into_owned();

        let (offset, line) = match self.db().get_cursor(&file_key)? {
            Some(cursor) if cursor.signature == signature => return Ok(None),
            Some(cursor) if signature.is_regression_of(&cursor.signature) => {
                tracing::warn!(
                    path = %path.display(),
                    previous_size = cursor.signature.size,
                    size = signature.size,
                    "file shrank, re-reading from the start"
                );
                (0, 0)
            }
            Some(cursor) => (cursor.byte_offset, cursor.last_line_number),
            None => (0, 0),
        };

        let chunk = read_complete_lines(path, offset, signature.size).map_err(io)?;

        let mut records = Vec::new();
        let mut summaries = Vec::new();
        let mut errors = 0;
        for (index, text) in chunk.lines.iter().enumerate() {
            if text.trim().is_empty() {
                continue;
            }
            match record::parse(text) {
                Ok(LogEntry::Message(record)) => records.push(record),
                Ok(LogEntry::Summary(summary)) => summaries.push(summary),
                Err(e) => {
                    errors += 1;
                    tracing::warn!(
                        path = %path.display(),
                        line = line + index as u64 + 1,
                        error = %e,
                        preview = e.preview(),
                        "skipping unparseable line"
                    );
                }
            }
        }

        Ok(Some(PendingPass {
            owner,
            project_dir: project_dir(path),
            records,
            summaries,
            errors,
            cursor: SyncCursor {
                file_path: file_key,
                last_line_number: line + chunk.lines.len() as u64,
                byte_offset: offset + chunk.consumed,
                signature,
            },
        }))
    }

    fn commit_pass(&self, pending: PendingPass) -> Result<SyncReport, SyncError> {
        let mut db = self.db();
        let errors = pending.errors;
        let (batch, skipped) = build_batch(&db, pending)?;
        let stats = db.commit_batch(&batch)?;
        Ok(SyncReport {
            inserted: stats.inserted,
            updated: stats.updated,
            skipped,
            errors,
        })
    }

    fn commit_live(
        &self,
        turn: Turn,
        records: &[LogRecord],
        hints: LiveHints,
    ) -> Result<SyncReport, SyncError> {
        let mut db = self.db();
        let uuids: Vec<&str> = turn.record_uuids.iter().map(String::as_str).collect();
        let existing = db.existing_record_uuids(&uuids)?;
        if !existing.is_empty() {
            tracing::debug!(turn = %turn.id, "live turn already stored from the log file");
            return Ok(SyncReport {
                skipped: turn.record_uuids.len(),
                ..SyncReport::default()
            });
        }

        let records: Vec<LogRecord> = records
            .iter()
            .filter(|r| turn.record_uuids.contains(&r.uuid))
            .cloned()
            .collect();
        let rows = records.iter().map(|r| record_row(r, &turn.id)).collect();

        let mut update = session_update(&turn.session_id, &records, None, None);
        if let Some(update) = update.as_mut() {
            update.fallback_title = update.fallback_title.take().or(hints.title);
            update.project_path = update.project_path.take().or(hints.project_path);
        }

        let stats = db.commit_batch(&SyncBatch {
            sessions: update.into_iter().collect(),
            turns: vec![turn],
            records: rows,
            cursor: None,
        })?;
        Ok(SyncReport {
            inserted: stats.inserted,
            updated: stats.updated,
            ..SyncReport::default()
        })
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parsed but uncommitted output of one pass.
struct PendingPass {
    owner: SessionId,
    project_dir: Option<String>,
    records: Vec<LogRecord>,
    summaries: Vec<SummaryRecord>,
    errors: usize,
    cursor: SyncCursor,
}

/// Turns a pass into a batch. Returns the batch and the number of records already stored.
fn build_batch(db: &Database, pending: PendingPass) -> Result<(SyncBatch, usize), DbError> {
    let PendingPass {
        owner,
        project_dir,
        records,
        summaries,
        cursor,
        ..
    } = pending;

    let uuids: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
    let existing = db.existing_record_uuids(&uuids)?;
    let owners: HashMap<String, SessionId> = records
        .iter()
        .map(|r| (r.uuid.clone(), r.session_id.clone()))
        .collect();
    let (known, fresh): (Vec<LogRecord>, Vec<LogRecord>) = records
        .into_iter()
        .partition(|r| existing.contains(&r.uuid));

    let mut titles: BTreeMap<SessionId, String> = BTreeMap::new();
    for summary in summaries {
        let leaf_owner = match summary.leaf_uuid.as_deref() {
            Some(leaf) => match owners.get(leaf) {
                Some(session_id) => Some(session_id.clone()),
                None => db.session_for_record(leaf)?,
            },
            None => None,
        };
        titles.insert(leaf_owner.unwrap_or_else(|| owner.clone()), summary.title);
    }

    let mut by_session = partition_by_session(fresh);
    let mut session_ids: BTreeSet<SessionId> = by_session.keys().cloned().collect();
    session_ids.extend(titles.keys().cloned());

    let mut batch = SyncBatch {
        cursor: Some(cursor),
        ..SyncBatch::default()
    };
    for session_id in session_ids {
        let records = order_records(by_session.remove(&session_id).unwrap_or_default());
        let summary_title = titles.remove(&session_id);

        let update = match session_update(&session_id, &records, summary_title.clone(), project_dir.clone()) {
            Some(update) => update,
            None => summary_only_update(db, &session_id, summary_title, project_dir.clone())?,
        };
        batch.sessions.push(update);

        if records.is_empty() {
            continue;
        }
        let (turns, rows) = rebuild_turns(db, &session_id, &records)?;
        batch.turns.extend(turns);
        batch.records.extend(rows);
    }

    Ok((batch, known.len()))
}

/// Continues the session's open turns with new records. Returns the turns that are new or
/// changed, and a row for every new record.
fn rebuild_turns(
    db: &Database,
    session_id: &SessionId,
    records: &[LogRecord],
) -> Result<(Vec<Turn>, Vec<RecordRow>), DbError> {
    let resumed = db.open_turns(session_id)?;
    let before = resumed.clone();
    let mut reconstructor = ThreadReconstructor::resume(resumed);
    for record in records {
        reconstructor.push(record);
    }

    let by_uuid: HashMap<&str, &LogRecord> = records.iter().map(|r| (r.uuid.as_str(), r)).collect();
    let mut changed = Vec::new();
    let mut rows = Vec::new();
    for (index, turn) in reconstructor.finish().into_iter().enumerate() {
        rows.extend(
            turn.record_uuids
                .iter()
                .filter_map(|uuid| by_uuid.get(uuid.as_str()))
                .map(|record| record_row(record, &turn.id)),
        );
        if before.get(index) != Some(&turn) {
            changed.push(turn);
        }
    }
    Ok((changed, rows))
}

/// Session facts from a session's new records, `None` when there are none.
fn session_update(
    session_id: &SessionId,
    records: &[LogRecord],
    summary_title: Option<String>,
    project_dir: Option<String>,
) -> Option<SessionUpdate> {
    let first_activity = records.iter().map(|r| r.timestamp).min()?;
    let last_activity = records.iter().map(|r| r.timestamp).max()?;
    Some(SessionUpdate {
        session_id: session_id.clone(),
        summary_title,
        fallback_title: records.iter().find_map(prompt_title),
        project_path: records.iter().find_map(|r| r.cwd.clone()),
        project_dir,
        first_activity,
        last_activity,
    })
}

/// A summary for a session with no new records keeps the session's known activity window.
fn summary_only_update(
    db: &Database,
    session_id: &SessionId,
    summary_title: Option<String>,
    project_dir: Option<String>,
) -> Result<SessionUpdate, DbError> {
    let (first_activity, last_activity) = match db.get_session(session_id)? {
        Some(existing) => (existing.created_at, existing.last_activity),
        None => (Utc::now(), Utc::now()),
    };
    Ok(SessionUpdate {
        session_id: session_id.clone(),
        summary_title,
        fallback_title: None,
        project_path: None,
        project_dir,
        first_activity,
        last_activity,
    })
}

/// Title candidate from a typed user prompt. Tool results never name a session.
fn prompt_title(record: &LogRecord) -> Option<String> {
    if record.kind != RecordKind::User || record.is_tool_result() {
        return None;
    }
    content::extract(record.kind, record.content())
        .iter()
        .filter(|segment| segment.segment_type == SegmentType::Text)
        .find_map(|segment| content::title_from_prompt(&segment.text))
}

fn record_row(record: &LogRecord, message_id: &str) -> RecordRow {
    RecordRow {
        uuid: record.uuid.clone(),
        session_id: record.session_id.clone(),
        message_id: message_id.to_string(),
        api_message_id: record.api_message_id().map(String::from),
        cost_usd: cost::record_cost(record),
        is_sidechain: record.is_sidechain,
    }
}

/// The session a log file belongs to, from its `<session_id>.jsonl` name.
fn owner_session(path: &Path) -> Result<SessionId, SyncError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| SessionId::new(stem).ok())
        .ok_or_else(|| SyncError::NotASessionFile {
            path: path.to_path_buf(),
        })
}

fn project_dir(path: &Path) -> Option<String> {
    path.parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .map(String::from)
}

struct LineChunk {
    lines: Vec<String>,
    /// Bytes covered by `lines`, terminators included.
    consumed: u64,
}

/// Reads newline-terminated lines in `[offset, end)`. A trailing line without its newline is
/// left for a later pass.
fn read_complete_lines(path: &Path, offset: u64, end: u64) -> std::io::Result<LineChunk> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file.take(end.saturating_sub(offset)));

    let mut lines = Vec::new();
    let mut consumed = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        consumed += read as u64;
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        lines.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(LineChunk { lines, consumed })
}
