//! Messages command: one session's reconstructed conversation.

use std::io::Write;

use anyhow::{Context, Result, bail};
use tl_core::SessionId;
use tl_db::{Database, SessionRecord, StoredMessage};

pub fn run<W: Write>(writer: &mut W, db: &Database, session_id: &str, json: bool) -> Result<()> {
    let session_id = SessionId::new(session_id).context("invalid session ID")?;
    let Some(session) = db.get_session(&session_id)? else {
        bail!("session not found: {session_id}");
    };
    let messages = db.get_messages(&session_id)?;

    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&messages)?)?;
    } else {
        write!(writer, "{}", format_messages(&session, &messages))?;
    }
    Ok(())
}

pub fn format_messages(session: &SessionRecord, messages: &[StoredMessage]) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    let _ = writeln!(output, "{} ({})", session.title, session.session_id);
    let _ = writeln!(output, "{}", session.project_path);

    for message in messages {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "[{}] {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.role
        );
        let _ = writeln!(output, "{}", message.content);
    }
    output
}
