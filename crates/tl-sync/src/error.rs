use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tl_core::{DiscoveryError, SessionId};
use tl_db::DbError;

/// Errors from sync passes, the watch pipeline and live streaming.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another pass held the session lock for longer than the bounded wait.
    #[error("timed out after {waited:?} waiting for the lock on session {session_id}")]
    LockTimeout {
        session_id: SessionId,
        waited: Duration,
    },

    /// A storage write failed. The batch was rolled back and the cursor left untouched.
    #[error("persistence error: {0}")]
    Persistence(#[from] DbError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file name is not `<session_id>.jsonl`.
    #[error("not a session log: {path}")]
    NotASessionFile { path: PathBuf },

    /// A pass ran past its time bound and was deferred.
    #[error("sync of {path} exceeded {limit:?}")]
    PassTimeout { path: PathBuf, limit: Duration },

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read live output: {0}")]
    Stream(#[source] std::io::Error),

    /// The live stream produced no line within the configured bound.
    #[error("no output from live session for {waited:?}")]
    LineTimeout { waited: Duration },
}

impl SyncError {
    /// Errors that mean "try again on the next cycle" rather than "this file is broken".
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::PassTimeout { .. })
    }
}
