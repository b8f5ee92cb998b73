//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Session log sync and message reconstruction.
///
/// Keeps a local store of agent CLI sessions in step with their JSONL logs and serves the
/// reconstructed conversations.
#[derive(Debug, Parser)]
#[command(name = "tl", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync one session log, or every log under the log root.
    Sync {
        /// Session log file (`<project>/<session_id>.jsonl`).
        path: Option<PathBuf>,
    },

    /// Sync everything, then follow changes under the log root until interrupted.
    Watch,

    /// List sessions, most recently active first.
    Sessions {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the reconstructed messages of a session.
    Messages {
        /// Session ID.
        session_id: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run one live exchange with the agent CLI, storing turns as they stream in.
    Live {
        /// Prompt to send.
        #[arg(long)]
        prompt: String,

        /// Continue an existing session.
        #[arg(long)]
        resume: Option<String>,

        /// Model override passed to the agent CLI.
        #[arg(long)]
        model: Option<String>,

        /// Working directory for the agent CLI.
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Show store status and files waiting to be synced.
    Status,
}
