//! Worker pool for distributed training runs
//!
//! Runs one worker inline, or fans out one OS process per local
//! accelerator and joins all of them. Process creation sits behind
//! [`WorkerSpawner`] so the launch logic can be tested without spawning.

mod entry;
mod launcher;
mod process;
mod slots;

pub use entry::{context_from_env, run_worker_from_env, WorkerEntry};
pub use launcher::{
    FailurePolicy, LaunchMode, LaunchReport, ProcessTopologyLauncher, SharedPreconditions,
    WorkerOutcome,
};
pub use process::{ChildProcess, ReexecSpawner, WorkerExit, WorkerProcess, WorkerSpawner};
pub use slots::{SlotInfo, SlotState, SlotTable, SlotTableHandle};

// Re-export types from launch-core for convenience
pub use launch_core::types::{LocalRank, WorkerContext};
