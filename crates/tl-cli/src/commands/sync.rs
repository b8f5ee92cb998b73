//! Sync command: one session log, or a full scan of the log root.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tl_db::Database;
use tl_sync::{SyncEngine, SyncReport};

use crate::Config;

pub fn run<W: Write>(
    writer: &mut W,
    db: Database,
    config: &Config,
    path: Option<&Path>,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let engine = SyncEngine::new(db, config.engine_config());

    runtime.block_on(async {
        if let Some(path) = path {
            let report = engine
                .sync(path)
                .await
                .with_context(|| format!("failed to sync {}", path.display()))?;
            writeln!(writer, "Synced {}", path.display())?;
            write_report(writer, &report)?;
        } else {
            let scan = engine
                .sync_all(&config.log_root)
                .await
                .with_context(|| format!("failed to scan {}", config.log_root.display()))?;
            writeln!(
                writer,
                "Synced {} session files under {}",
                scan.files,
                config.log_root.display()
            )?;
            if scan.failed > 0 {
                writeln!(writer, "Failed files: {}", scan.failed)?;
            }
            write_report(writer, &scan.totals)?;
        }
        anyhow::Ok(())
    })
}

fn write_report<W: Write>(writer: &mut W, report: &SyncReport) -> std::io::Result<()> {
    writeln!(writer, "Inserted: {}", report.inserted)?;
    writeln!(writer, "Updated:  {}", report.updated)?;
    writeln!(writer, "Skipped:  {}", report.skipped)?;
    writeln!(writer, "Errors:   {}", report.errors)
}
