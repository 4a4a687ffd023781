//! Worker entry that hands each worker to an external trainer program

use async_trait::async_trait;
use launch_core::{Error, Result, WorkerContext, WORKER_CONTEXT_ENV};
use tokio::process::Command;
use tracing::{error, info};
use worker_pool::{WorkerEntry, WorkerExit};

/// Runs the `[WORKER]` program once per worker and waits for it
///
/// The program sees the same environment a re-executed worker does, plus
/// the `[WORKER] env` table. It stays in the worker's process group, so the
/// launcher's group kill reaches it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalTrainer;

impl ExternalTrainer {
    pub fn command(ctx: &WorkerContext) -> Result<Command> {
        let worker = &ctx.config.worker;
        let program = worker
            .program
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::config(&["WORKER.program"], "no trainer program configured"))?;

        let mut cmd = Command::new(program);
        cmd.args(&worker.args)
            .envs(&worker.env)
            .env(WORKER_CONTEXT_ENV, ctx.to_json()?)
            .envs(ctx.rank_env())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl WorkerEntry for ExternalTrainer {
    async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut cmd = Self::command(&ctx)?;
        let status = cmd.status().await.map_err(|e| Error::SpawnFailed {
            local_rank: ctx.local_rank,
            message: e.to_string(),
        })?;

        match WorkerExit::from_status(status) {
            WorkerExit::Success => {
                info!(local_rank = ctx.local_rank, "Trainer finished");
                Ok(())
            }
            exit => {
                error!(local_rank = ctx.local_rank, exit = ?exit, "Trainer failed");
                Err(Error::WorkerFailure {
                    failed_ranks: vec![ctx.local_rank],
                    total: 1,
                })
            }
        }
    }
}
