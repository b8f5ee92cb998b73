//! Sessions command: the synced sessions, most recently active first.

use std::io::Write;

use anyhow::Result;
use tl_core::content::truncate_chars;
use tl_db::{Database, SessionRecord};

const TITLE_WIDTH: usize = 48;

pub fn run<W: Write>(writer: &mut W, db: &Database, json: bool) -> Result<()> {
    let sessions = db.list_sessions()?;

    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&sessions)?)?;
    } else {
        write!(writer, "{}", format_sessions(&sessions))?;
    }
    Ok(())
}

pub fn format_sessions(sessions: &[SessionRecord]) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    if sessions.is_empty() {
        output.push_str("No sessions synced yet.\n");
        output.push_str("Hint: Run 'tl sync' to import session logs.\n");
        return output;
    }

    let _ = writeln!(
        output,
        "{:<20}  {:<16}  {:>8}  {:>8}  Title",
        "Session", "Last activity", "Messages", "Cost"
    );
    for session in sessions {
        let (mut title, truncated) = truncate_chars(&session.title, TITLE_WIDTH);
        if truncated {
            title.push_str("...");
        }
        let cost = format!("${:.2}", session.cost_usd);
        let _ = writeln!(
            output,
            "{:<20}  {:<16}  {:>8}  {:>8}  {}",
            session.session_id.as_str(),
            session.last_activity.format("%Y-%m-%d %H:%M").to_string(),
            session.message_count,
            cost,
            title,
        );
        let _ = writeln!(output, "{:<20}  {}", "", session.project_path);
    }
    output
}
