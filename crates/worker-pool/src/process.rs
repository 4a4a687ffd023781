//! Worker processes and how they are spawned

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;
use launch_core::{Error, Result, WorkerContext, WORKER_CONTEXT_ENV};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    Success,

    /// Non-zero exit; `None` when terminated by a signal
    Failed { code: Option<i32> },

    /// In-process worker returned an error
    Errored { message: String },

    /// Terminated by the launcher
    Killed,

    SpawnFailed { message: String },
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            WorkerExit::Success
        } else {
            WorkerExit::Failed {
                code: status.code(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Success)
    }
}

/// A running worker
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Wait for the worker to terminate
    async fn wait(&mut self) -> Result<WorkerExit>;

    /// Terminate the worker and reap it
    async fn kill(&mut self) -> Result<()>;
}

/// Starts one worker for a context
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, ctx: &WorkerContext) -> Result<Box<dyn WorkerProcess>>;
}

/// A worker backed by an OS child process
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,

    /// The child leads its own process group, so kills reach its descendants
    group_leader: bool,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            group_leader: false,
        }
    }

    /// Wrap a child started with `process_group(0)`
    pub fn group_leader(child: Child) -> Self {
        Self {
            child,
            group_leader: true,
        }
    }
}

/// SIGKILL every process in group `pgid`
#[cfg(unix)]
async fn kill_process_group(pgid: u32) {
    let status = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pgid}"))
        .status()
        .await;
    match status {
        Ok(status) if status.success() => debug!(pgid, "Killed worker process group"),
        Ok(status) => warn!(pgid, ?status, "Failed to kill worker process group"),
        Err(e) => warn!(pgid, error = %e, "Failed to kill worker process group"),
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self.child.wait().await?;
        Ok(WorkerExit::from_status(status))
    }

    async fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if self.group_leader {
            if let Some(pid) = self.child.id() {
                kill_process_group(pid).await;
            }
        }
        self.child.kill().await?;
        Ok(())
    }
}

/// Spawns workers by re-executing a launcher binary
///
/// Every worker gets the same program and arguments; its context travels as
/// JSON in `LAUNCH_WORKER_CONTEXT`, alongside the conventional
/// `LOCAL_RANK`/`RANK`/`WORLD_SIZE` variables and the determinism knobs.
#[derive(Debug, Clone)]
pub struct ReexecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ReexecSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary with the given arguments
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| Error::Internal {
            message: format!("failed to determine current executable: {e}"),
        })?;
        Ok(Self::new(program, args))
    }

    /// The command a worker for `ctx` is started with
    ///
    /// On unix the worker leads a new process group, so killing it also
    /// kills any trainer it started.
    pub fn command(&self, ctx: &WorkerContext) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_CONTEXT_ENV, ctx.to_json()?)
            .envs(ctx.rank_env())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }
}

impl WorkerSpawner for ReexecSpawner {
    fn spawn(&self, ctx: &WorkerContext) -> Result<Box<dyn WorkerProcess>> {
        let child = self
            .command(ctx)?
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                local_rank: ctx.local_rank,
                message: e.to_string(),
            })?;

        info!(
            local_rank = ctx.local_rank,
            rank = ctx.global_rank,
            pid = ?child.id(),
            program = %self.program.display(),
            "Spawned worker process"
        );
        debug!(args = ?self.args, "Worker arguments");

        Ok(Box::new(ChildProcess::group_leader(child)))
    }
}
