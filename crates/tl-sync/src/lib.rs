//! Sync layer for threadline.
//!
//! Moves session logs into the store: incremental file passes ([`SyncEngine`]), a debounced
//! filesystem watch loop ([`WatchPipeline`]) and live CLI sessions ([`run_live`]). All three
//! share per-session locks and the store's record-level dedup.

pub mod engine;
pub mod error;
pub mod live;
pub mod lock;
pub mod pipeline;

pub use engine::{EngineConfig, LiveHints, ScanReport, SyncEngine, SyncReport};
pub use error::SyncError;
pub use live::{LiveOutcome, LiveRequest, run_live, stream_events};
pub use lock::{SessionGuard, SessionLocks};
pub use pipeline::{PipelineConfig, WatchPipeline};
