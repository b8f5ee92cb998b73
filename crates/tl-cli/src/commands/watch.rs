//! Watch command: keep the store in step with the log root until Ctrl-C.

use anyhow::{Context, Result};
use tl_db::Database;
use tl_sync::{SyncEngine, WatchPipeline};

use crate::Config;

pub fn run(db: Database, config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let engine = SyncEngine::new(db, config.engine_config());
    let pipeline = WatchPipeline::new(engine, config.pipeline_config());

    eprintln!(
        "Watching {} (Ctrl-C to stop)",
        config.log_root.display()
    );
    runtime.block_on(pipeline.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
    }))?;
    Ok(())
}
