//! Watch pipeline: filesystem notifications in, sync passes out.
//!
//! Notifications are debounced, mapped to session files and dispatched to the engine. At most
//! one pass per file runs at a time; a notification for a file that is mid-pass marks it for a
//! rerun instead of starting a second pass. Passes that hit a lock or time bound are retried on
//! the next tick. If the watcher cannot start, the pipeline degrades to periodic full rescans.
//! A watcher that reports an error after startup (for example an event queue overflow) may have
//! dropped events, so each such error triggers one full rescan.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tl_core::{SessionFile, scan_session_files};

use crate::engine::{SyncEngine, SyncReport};
use crate::error::SyncError;

const CHANNEL_CAPACITY: usize = 256;

/// What the watcher tells the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchSignal {
    /// Something under the root changed.
    Changed(PathBuf),
    /// Events may have been lost; rescan everything.
    Rescan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Log root: `<root>/<project>/<session_id>.jsonl`.
    pub root: PathBuf,
    /// Quiet period before a burst of writes to one file becomes a single notification.
    pub debounce: Duration,
    /// How often deferred passes are retried, and how often a degraded pipeline rescans.
    pub rescan_interval: Duration,
}

impl PipelineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce: Duration::from_millis(250),
            rescan_interval: Duration::from_secs(60),
        }
    }
}

pub struct WatchPipeline {
    engine: SyncEngine,
    config: PipelineConfig,
}

impl WatchPipeline {
    pub const fn new(engine: SyncEngine, config: PipelineConfig) -> Self {
        Self { engine, config }
    }

    /// Runs an initial full scan, then follows changes until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<(), SyncError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SyncError::Io { path, source }
        };
        let root = &self.config.root;
        tokio::fs::create_dir_all(root).await.map_err(io(root))?;
        let root = tokio::fs::canonicalize(root).await.map_err(io(root))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let watcher = match start_watcher(&root, self.config.debounce, tx) {
            Ok(watcher) => {
                tracing::info!(root = %root.display(), "watching for session changes");
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(
                    root = %root.display(),
                    error = %e,
                    interval = ?self.config.rescan_interval,
                    "file watching unavailable, falling back to periodic rescans"
                );
                None
            }
        };

        self.engine.sync_all(&root).await?;

        let degraded = watcher.is_none();
        drive(
            &self.engine,
            &root,
            rx,
            degraded,
            self.config.rescan_interval,
            shutdown,
        )
        .await;

        drop(watcher);
        tracing::info!("watch pipeline stopped");
        Ok(())
    }
}

fn start_watcher(
    root: &Path,
    debounce: Duration,
    tx: mpsc::Sender<WatchSignal>,
) -> Result<Debouncer<RecommendedWatcher>, notify::Error> {
    let mut debouncer = new_debouncer(
        debounce,
        move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
            Ok(events) => {
                for event in events {
                    if tx.blocking_send(WatchSignal::Changed(event.path)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "file watcher error, scheduling a full rescan");
                let _ = tx.blocking_send(WatchSignal::Rescan);
            }
        },
    )?;
    debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

/// Dispatch state: which files are mid-pass, which need another pass, and which are deferred.
struct Dispatcher<'a> {
    engine: &'a SyncEngine,
    tasks: JoinSet<(PathBuf, Result<SyncReport, SyncError>)>,
    in_flight: HashSet<PathBuf>,
    rerun: HashSet<PathBuf>,
    deferred: HashSet<PathBuf>,
}

impl<'a> Dispatcher<'a> {
    fn new(engine: &'a SyncEngine) -> Self {
        Self {
            engine,
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
            rerun: HashSet::new(),
            deferred: HashSet::new(),
        }
    }

    fn dispatch(&mut self, path: PathBuf) {
        if self.in_flight.contains(&path) {
            self.rerun.insert(path);
            return;
        }
        self.deferred.remove(&path);
        self.in_flight.insert(path.clone());
        let engine = self.engine.clone();
        self.tasks.spawn(async move {
            let result = engine.sync(&path).await;
            (path, result)
        });
    }

    fn complete(&mut self, path: PathBuf, result: Result<SyncReport, SyncError>) {
        self.in_flight.remove(&path);
        match result {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(path = %path.display(), error = %e, "sync deferred to next cycle");
                self.deferred.insert(path.clone());
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "sync failed"),
        }
        if self.rerun.remove(&path) {
            self.dispatch(path);
        }
    }

    fn retry_deferred(&mut self) {
        let deferred: Vec<PathBuf> = self.deferred.drain().collect();
        for path in deferred {
            self.dispatch(path);
        }
    }
}

/// The event loop behind [`WatchPipeline::run`].
pub(crate) async fn drive(
    engine: &SyncEngine,
    root: &Path,
    mut rx: mpsc::Receiver<WatchSignal>,
    degraded: bool,
    rescan_interval: Duration,
    shutdown: impl Future<Output = ()> + Send,
) {
    let mut dispatcher = Dispatcher::new(engine);
    let mut ticker = tokio::time::interval(rescan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut events_open = true;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            received = rx.recv(), if events_open => match received {
                Some(WatchSignal::Changed(path)) => match SessionFile::from_path(root, &path) {
                    Some(file) => dispatcher.dispatch(file.path),
                    None => tracing::trace!(path = %path.display(), "ignoring non-session path"),
                },
                Some(WatchSignal::Rescan) => rescan(root, &mut dispatcher).await,
                None => events_open = false,
            },
            _ = ticker.tick() => {
                if degraded {
                    rescan(root, &mut dispatcher).await;
                } else {
                    dispatcher.retry_deferred();
                }
            }
            Some(joined) = dispatcher.tasks.join_next() => match joined {
                Ok((path, result)) => dispatcher.complete(path, result),
                Err(e) => tracing::error!(error = %e, "sync task panicked"),
            },
        }
    }

    while let Some(joined) = dispatcher.tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "sync task panicked");
        }
    }
}

async fn rescan(root: &Path, dispatcher: &mut Dispatcher<'_>) {
    let scan_root = root.to_path_buf();
    match tokio::task::spawn_blocking(move || scan_session_files(&scan_root)).await {
        Ok(Ok(files)) => {
            for file in files {
                dispatcher.dispatch(file.path);
            }
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "rescan failed"),
        Err(e) => tracing::error!(error = %e, "rescan task panicked"),
    }
}
