//! Status command: store totals and log files waiting to be synced.

use std::io::Write;

use anyhow::{Context, Result};
use tl_core::discovery::{scan_session_files, signatures};
use tl_db::Database;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    let stats = db.stats()?;
    let files = scan_session_files(&config.log_root)
        .with_context(|| format!("failed to scan {}", config.log_root.display()))?;
    let total_files = files.len();

    let mut pending = 0;
    for (file, signature) in signatures(files) {
        let key = file.path.to_string_lossy();
        let synced = db
            .get_cursor(&key)?
            .is_some_and(|cursor| cursor.signature == signature);
        if !synced {
            pending += 1;
        }
    }

    writeln!(writer, "Threadline status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(writer, "Log root: {}", config.log_root.display())?;
    writeln!(writer, "Sessions: {}", stats.sessions)?;
    writeln!(writer, "Messages: {}", stats.messages)?;
    writeln!(writer, "Records:  {}", stats.records)?;
    writeln!(writer, "Synced files: {}", stats.cursors)?;
    writeln!(writer, "Log files: {total_files} ({pending} with unsynced changes)")?;

    Ok(())
}
