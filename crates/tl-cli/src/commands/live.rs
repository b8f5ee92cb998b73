//! Live command: one streamed exchange with the agent CLI.

use std::io::Write;

use anyhow::{Context, Result};
use tl_db::Database;
use tl_sync::{LiveOutcome, LiveRequest, SyncEngine, run_live};

use crate::Config;

pub fn run<W: Write + Send>(
    writer: &mut W,
    db: Database,
    config: &Config,
    request: &LiveRequest,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let engine = SyncEngine::new(db, config.engine_config());

    let mut write_error = None;
    let outcome = runtime
        .block_on(run_live(&engine, request, |turn| {
            if write_error.is_none() {
                if let Err(e) = writeln!(writer, "[{}]\n{}\n", turn.role, turn.rendered()) {
                    write_error = Some(e);
                }
            }
        }))
        .context("live session failed")?;
    if let Some(e) = write_error {
        return Err(e).context("failed to write live output");
    }

    write_summary(writer, &outcome)?;
    Ok(())
}

fn write_summary<W: Write>(writer: &mut W, outcome: &LiveOutcome) -> std::io::Result<()> {
    match &outcome.session_id {
        Some(session_id) => writeln!(writer, "Session: {session_id}")?,
        None => writeln!(writer, "Session: (unknown)")?,
    }
    writeln!(
        writer,
        "Stored: {} new, {} updated, {} already synced",
        outcome.report.inserted, outcome.report.updated, outcome.report.skipped
    )?;
    if outcome.parse_errors > 0 {
        writeln!(writer, "Unparseable lines: {}", outcome.parse_errors)?;
    }
    if let Some(completion) = &outcome.completion {
        if completion.is_error {
            writeln!(writer, "Finished with an error")?;
        }
        if let Some(cost) = completion.total_cost_usd {
            writeln!(writer, "Reported cost: ${cost:.4}")?;
        }
    }
    Ok(())
}
