//! Launch Core - Foundation for the distributed training launcher
//!
//! Provides the typed run configuration and its reconciliation, the
//! parallelism topology, the determinism policy, run naming and the
//! error taxonomy shared by the dataset gate and the worker pool.

pub mod compat;
pub mod config;
pub mod determinism;
pub mod error;
pub mod run_name;
pub mod topology;
pub mod types;

pub use config::{reconcile, Overrides, RunConfiguration};
pub use determinism::{select_seed, select_seed_with, DeterminismMode, SeedSelection};
pub use error::{ConfigViolation, DataPrepError, Error, Result};
pub use run_name::{make_run_name, RunNameParts, DEFAULT_RUN_NAME_TEMPLATE};
pub use topology::{FixedTopology, HostTopologyProvider, SystemTopology, TopologyDescriptor};
pub use types::*;
