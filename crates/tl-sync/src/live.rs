//! Live sessions: run the CLI with streaming JSON output and store turns as they complete.
//!
//! Finalized turns go through [`SyncEngine::ingest_live`], under the same session locks and
//! record-level dedup as file passes, so a later sync of the session's log file adds nothing
//! the live path already stored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tl_core::content::title_from_prompt;
use tl_core::record::{ResultEvent, parse_stream_event};
use tl_core::{LogEntry, LogRecord, SessionId, StreamEvent, StreamingGrouper, Turn};

use crate::engine::{LiveHints, SyncEngine, SyncReport};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRequest {
    pub prompt: String,
    /// Session to continue instead of starting a new one.
    pub resume: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    /// CLI executable name or path.
    pub binary: String,
    /// Longest silence tolerated between two output lines.
    pub line_timeout: Duration,
}

impl LiveRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            resume: None,
            model: None,
            cwd: None,
            binary: "claude".to_string(),
            line_timeout: Duration::from_secs(300),
        }
    }

    /// The CLI invocation, with stdout piped for streaming JSON.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(["-p", "--verbose", "--output-format", "stream-json"]);
        if let Some(session_id) = &self.resume {
            command.args(["--resume", session_id]);
        }
        if let Some(model) = &self.model {
            command.args(["--model", model]);
        }
        command.arg(&self.prompt);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    fn hints(&self) -> LiveHints {
        LiveHints {
            title: title_from_prompt(&self.prompt),
            project_path: self.cwd.as_ref().map(|cwd| cwd.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveOutcome {
    pub session_id: Option<SessionId>,
    pub report: SyncReport,
    pub completion: Option<ResultEvent>,
    pub parse_errors: usize,
}

/// Spawns the CLI and streams its output into the store.
pub async fn run_live(
    engine: &SyncEngine,
    request: &LiveRequest,
    on_turn: impl FnMut(&Turn) + Send,
) -> Result<LiveOutcome, SyncError> {
    let spawn_error = |source| SyncError::Spawn {
        program: request.binary.clone(),
        source,
    };
    let mut child = request.command().spawn().map_err(spawn_error)?;
    let Some(stdout) = child.stdout.take() else {
        return Err(spawn_error(std::io::Error::other("stdout was not captured")));
    };

    tracing::info!(binary = %request.binary, resume = ?request.resume, "live session started");
    let result = stream_events(
        engine,
        BufReader::new(stdout),
        request.hints(),
        request.line_timeout,
        on_turn,
    )
    .await;

    if result.is_ok() {
        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!(%status, "live session exited unsuccessfully");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to wait for live session"),
        }
    } else if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to stop live session");
    }
    result
}

/// Reads stream events line by line, grouping them into turns and storing each finalized turn.
///
/// Stops at the completion event or end of output. Whatever turn is still buffered at that point
/// is stored as well.
pub async fn stream_events<R>(
    engine: &SyncEngine,
    reader: R,
    mut hints: LiveHints,
    line_timeout: Duration,
    mut on_turn: impl FnMut(&Turn) + Send,
) -> Result<LiveOutcome, SyncError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut lines = reader.lines();
    let mut grouper = StreamingGrouper::new();
    let mut buffered: HashMap<String, LogRecord> = HashMap::new();
    let mut outcome = LiveOutcome::default();
    let mut timed_out = false;

    loop {
        let line = match tokio::time::timeout(line_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(SyncError::Stream(e)),
            Err(_) => {
                timed_out = true;
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match parse_stream_event(&line, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                outcome.parse_errors += 1;
                tracing::warn!(error = %e, preview = e.preview(), "skipping unparseable stream line");
                continue;
            }
        };
        match &event {
            StreamEvent::Init { cwd: Some(cwd), .. } => {
                hints.project_path.get_or_insert_with(|| cwd.clone());
            }
            StreamEvent::Entry(LogEntry::Message(record)) => {
                buffered.insert(record.uuid.clone(), record.clone());
            }
            _ => {}
        }
        let completed = matches!(event, StreamEvent::Result(_));

        for turn in grouper.push(event) {
            on_turn(&turn);
            outcome.report += store_turn(engine, turn, &mut buffered, &hints).await?;
        }
        if completed {
            break;
        }
    }

    if let Some(turn) = grouper.flush() {
        on_turn(&turn);
        outcome.report += store_turn(engine, turn, &mut buffered, &hints).await?;
    }
    if timed_out {
        return Err(SyncError::LineTimeout {
            waited: line_timeout,
        });
    }

    outcome.session_id = grouper.session_id().cloned();
    outcome.completion = grouper.completion().cloned();
    Ok(outcome)
}

/// Stores one turn. A lock or time bound failure is not fatal: the CLI also writes the session
/// log, so the next file sync stores the turn instead.
async fn store_turn(
    engine: &SyncEngine,
    turn: Turn,
    buffered: &mut HashMap<String, LogRecord>,
    hints: &LiveHints,
) -> Result<SyncReport, SyncError> {
    let records = turn
        .record_uuids
        .iter()
        .filter_map(|uuid| buffered.remove(uuid))
        .collect();
    let turn_id = turn.id.clone();
    match engine.ingest_live(turn, records, hints.clone()).await {
        Ok(report) => Ok(report),
        Err(e) if e.is_retryable() => {
            tracing::warn!(turn = %turn_id, error = %e, "live turn left for the next file sync");
            Ok(SyncReport::default())
        }
        Err(e) => Err(e),
    }
}
