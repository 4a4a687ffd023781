//! Worker entry point
//!
//! The training body itself lives outside this crate. The launcher only
//! hands it a [`WorkerContext`] and looks at success or failure.

use async_trait::async_trait;
use launch_core::{Error, Result, WorkerContext, WORKER_CONTEXT_ENV};
use tracing::info;

/// The opaque per-worker training body
#[async_trait]
pub trait WorkerEntry: Send + Sync {
    /// Run one worker to completion
    async fn run(&self, ctx: WorkerContext) -> Result<()>;
}

/// Read the context a launcher passed to this worker process
pub fn context_from_env() -> Result<WorkerContext> {
    let json = std::env::var(WORKER_CONTEXT_ENV).map_err(|_| Error::Usage {
        message: format!("{WORKER_CONTEXT_ENV} is not set; worker processes are started by the launcher"),
    })?;
    WorkerContext::from_json(&json)
}

/// Body of a spawned worker process
pub async fn run_worker_from_env(entry: &dyn WorkerEntry) -> Result<()> {
    let ctx = context_from_env()?;
    info!(
        local_rank = ctx.local_rank,
        rank = ctx.global_rank,
        world_size = ctx.world_size,
        run_name = %ctx.run_name,
        "Worker process started"
    );
    entry.run(ctx).await
}
