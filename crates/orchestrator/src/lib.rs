//! Orchestrator - composes the launch pipeline behind the `launch` binary
//!
//! A launch reconciles the run configuration, prepares the shared dataset
//! bundle, fixes the run name and seed, then runs one worker inline or fans
//! out one worker process per local accelerator.

pub mod app;
pub mod cli;
mod external;
mod preconditions;

pub use app::{exit_code, run_cli, Orchestrator};
pub use cli::{normalize_args, Cli, Commands, RunArgs};
pub use external::ExternalTrainer;
pub use preconditions::RunFilesystem;
