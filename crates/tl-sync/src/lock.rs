//! Per-session advisory locks.
//!
//! Every write path (file sync and live ingest) takes the lock of each session it touches before
//! building and committing its batch. Passes for different sessions run concurrently; passes for
//! the same session queue up, but only for a bounded time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tl_core::SessionId;

use crate::error::SyncError;

/// Held while a pass works on a session. Dropping it releases the lock.
pub type SessionGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    locks: Arc<DashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `wait` for the session's lock.
    pub async fn acquire(
        &self,
        session_id: &SessionId,
        wait: Duration,
    ) -> Result<SessionGuard, SyncError> {
        let mutex = self
            .locks
            .entry(session_id.clone())
            .or_default()
            .value()
            .clone();

        tokio::time::timeout(wait, mutex.lock_owned())
            .await
            .map_err(|_| SyncError::LockTimeout {
                session_id: session_id.clone(),
                waited: wait,
            })
    }

    /// Acquires several locks in sorted order, each with its own bounded wait.
    pub async fn acquire_all<'a>(
        &self,
        session_ids: impl IntoIterator<Item = &'a SessionId>,
        wait: Duration,
    ) -> Result<Vec<SessionGuard>, SyncError> {
        let ordered: BTreeSet<&SessionId> = session_ids.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for session_id in ordered {
            guards.push(self.acquire(session_id, wait).await?);
        }
        Ok(guards)
    }
}
