//! Session log discovery.
//!
//! The log root holds one directory per project and one `<session_id>.jsonl` file per session.
//! That tree is the only index; there is no manifest to keep in sync.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionId;

const LOG_EXTENSION: &str = "jsonl";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A session log file located under the log root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    pub path: PathBuf,
    /// Name of the project directory the file lives in.
    pub project_dir: String,
    /// Session id taken from the file stem.
    pub session_id: SessionId,
}

impl SessionFile {
    /// Recognizes `<root>/<project>/<session_id>.jsonl`. Anything else is `None`.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        if path.extension().is_none_or(|ext| ext != LOG_EXTENSION) {
            return None;
        }
        let relative = path.strip_prefix(root).ok()?;
        let mut components = relative.components();
        let project_dir = components.next()?.as_os_str().to_str()?.to_string();
        components.next()?;
        if components.next().is_some() {
            return None;
        }

        let session_id = SessionId::new(path.file_stem()?.to_str()?).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            project_dir,
            session_id,
        })
    }
}

/// Size and modification time of a file, used to detect change and rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    pub size: u64,
    pub mtime_ms: i64,
}

impl FileSignature {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mtime_ms = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        Ok(Self {
            size: metadata.len(),
            mtime_ms,
        })
    }

    /// A shrinking file has been rewritten or truncated, not appended to.
    pub const fn is_regression_of(&self, stored: &Self) -> bool {
        self.size < stored.size
    }
}

/// Lists every session file under `root`, sorted by path.
///
/// A missing root yields an empty list. Unreadable project directories are logged and skipped so
/// one bad directory does not hide the others.
pub fn scan_session_files(root: &Path) -> Result<Vec<SessionFile>, DiscoveryError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DiscoveryError::Io { path, source }
    };

    let mut files = Vec::new();
    for project_entry in std::fs::read_dir(root).map_err(io_err(root))? {
        let project_path = project_entry.map_err(io_err(root))?.path();
        if !project_path.is_dir() {
            continue;
        }

        let entries = match std::fs::read_dir(&project_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %project_path.display(), error = %e, "skipping unreadable project directory");
                continue;
            }
        };

        for session_entry in entries.flatten() {
            let session_path = session_entry.path();
            if !session_path.is_file() {
                continue;
            }
            match SessionFile::from_path(root, &session_path) {
                Some(file) => files.push(file),
                None if session_path.extension().is_some_and(|e| e == LOG_EXTENSION) => {
                    tracing::warn!(path = %session_path.display(), "skipping session file with empty session ID");
                }
                None => {}
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Reads signatures for many files in parallel. Files that vanished in the meantime are dropped.
pub fn signatures(files: Vec<SessionFile>) -> Vec<(SessionFile, FileSignature)> {
    files
        .into_par_iter()
        .filter_map(|file| match FileSignature::of(&file.path) {
            Ok(signature) => Some((file, signature)),
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "skipping file without signature");
                None
            }
        })
        .collect()
}
