//! Process topology launcher
//!
//! One launch runs in exactly one of two modes, chosen up front:
//!
//! - **Inline**: a single worker runs on the caller's task, no process is
//!   spawned. Used when distribution is off or the world size is 1.
//! - **Fan-out**: shared preconditions run once, then one worker process is
//!   spawned per local accelerator and all of them are joined.

use std::sync::Arc;

use async_trait::async_trait;
use launch_core::{Error, LocalRank, Result, TopologyDescriptor, WorkerContext};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{SlotTable, SlotTableHandle, WorkerEntry, WorkerExit, WorkerProcess, WorkerSpawner};

/// How the workers of a launch run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LaunchMode {
    Inline,
    FanOut,
}

/// What happens to sibling workers when one fails
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Wait for every worker regardless of failures
    #[default]
    JoinAll,

    /// Kill the surviving workers after the first failure, then wait for them
    CancelOnFailure,
}

/// Work that must finish once, before the first worker is spawned
#[async_trait]
pub trait SharedPreconditions: Send + Sync {
    async fn prepare(&self) -> Result<()>;
}

/// Final state of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub local_rank: LocalRank,
    pub exit: WorkerExit,
}

/// Outcome of a whole launch, ordered by local rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchReport {
    pub mode: LaunchMode,
    pub outcomes: Vec<WorkerOutcome>,
}

impl LaunchReport {
    pub fn is_success(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.exit.is_success())
    }

    pub fn failed_ranks(&self) -> Vec<LocalRank> {
        self.outcomes
            .iter()
            .filter(|o| !o.exit.is_success())
            .map(|o| o.local_rank)
            .collect()
    }

    /// Turn a report with failed workers into [`Error::WorkerFailure`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::WorkerFailure {
                failed_ranks: self.failed_ranks(),
                total: self.outcomes.len(),
            })
        }
    }
}

/// Spawns, names and joins the workers of one node
pub struct ProcessTopologyLauncher {
    /// Worker body for inline mode
    entry: Arc<dyn WorkerEntry>,

    /// Process factory for fan-out mode
    spawner: Arc<dyn WorkerSpawner>,

    preconditions: Option<Arc<dyn SharedPreconditions>>,
    policy: FailurePolicy,

    /// Cancelled to terminate all running workers
    cancel: CancellationToken,

    slots: SlotTableHandle,
}

impl ProcessTopologyLauncher {
    pub fn new(entry: Arc<dyn WorkerEntry>, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            entry,
            spawner,
            preconditions: None,
            policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
            slots: Arc::new(SlotTable::new()),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_preconditions(mut self, preconditions: Arc<dyn SharedPreconditions>) -> Self {
        self.preconditions = Some(preconditions);
        self
    }

    /// Token that terminates every running worker when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn slots(&self) -> SlotTableHandle {
        Arc::clone(&self.slots)
    }

    pub fn mode_for(topology: &TopologyDescriptor, distributed: bool) -> LaunchMode {
        if distributed && topology.world_size > 1 {
            LaunchMode::FanOut
        } else {
            LaunchMode::Inline
        }
    }

    /// Run the workers of this node and wait for all of them
    ///
    /// `contexts` builds the context of the worker on a local rank; every
    /// context must be cut from the same finalized plan.
    pub async fn launch<F>(
        &self,
        topology: &TopologyDescriptor,
        distributed: bool,
        contexts: F,
    ) -> Result<LaunchReport>
    where
        F: Fn(LocalRank) -> WorkerContext,
    {
        match Self::mode_for(topology, distributed) {
            LaunchMode::Inline => self.run_inline(topology, contexts).await,
            LaunchMode::FanOut => self.fan_out(topology, contexts).await,
        }
    }

    async fn run_inline<F>(&self, topology: &TopologyDescriptor, contexts: F) -> Result<LaunchReport>
    where
        F: Fn(LocalRank) -> WorkerContext,
    {
        let local_rank = topology.current_accelerator;
        if topology.is_degenerate() {
            info!("Single device selected; data parallelism is disabled");
        }
        info!(local_rank, "Running worker inline");

        self.slots.register(local_rank);
        self.slots.mark_running(local_rank, None);

        let exit = match self.entry.run(contexts(local_rank)).await {
            Ok(()) => WorkerExit::Success,
            Err(e) => {
                error!(local_rank, error = %e, "Worker failed");
                WorkerExit::Errored {
                    message: e.to_string(),
                }
            }
        };
        self.slots.finish(local_rank, exit.clone());

        Ok(LaunchReport {
            mode: LaunchMode::Inline,
            outcomes: vec![WorkerOutcome { local_rank, exit }],
        })
    }

    async fn fan_out<F>(&self, topology: &TopologyDescriptor, contexts: F) -> Result<LaunchReport>
    where
        F: Fn(LocalRank) -> WorkerContext,
    {
        if let Some(preconditions) = &self.preconditions {
            preconditions.prepare().await?;
        }

        info!(
            workers = topology.accelerators_per_node,
            world_size = topology.world_size,
            node = topology.current_node,
            policy = ?self.policy,
            "Launching workers in distributed data parallel mode"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outcomes = Vec::with_capacity(topology.accelerators_per_node);

        for local_rank in topology.local_slots() {
            if self.cancel.is_cancelled() {
                warn!(local_rank, "Launch cancelled; remaining workers not started");
                break;
            }

            let ctx = contexts(local_rank);
            self.slots.register(local_rank);

            match self.spawner.spawn(&ctx) {
                Ok(process) => {
                    self.slots.mark_running(local_rank, process.id());
                    tokio::spawn(supervise(
                        local_rank,
                        process,
                        self.cancel.clone(),
                        tx.clone(),
                    ));
                }
                Err(e) => {
                    error!(local_rank, error = %e, "Failed to spawn worker");
                    let exit = WorkerExit::SpawnFailed {
                        message: e.to_string(),
                    };
                    self.slots.finish(local_rank, exit.clone());
                    outcomes.push(WorkerOutcome { local_rank, exit });
                    // Started workers cannot rendezvous without this rank
                    self.cancel.cancel();
                    break;
                }
            }
        }
        drop(tx);

        // Join all
        while let Some(outcome) = rx.recv().await {
            self.slots.finish(outcome.local_rank, outcome.exit.clone());

            if !outcome.exit.is_success()
                && self.policy == FailurePolicy::CancelOnFailure
                && !self.cancel.is_cancelled()
            {
                warn!(
                    local_rank = outcome.local_rank,
                    running = ?self.slots.running(),
                    "Worker failed; terminating siblings"
                );
                self.cancel.cancel();
            }
            outcomes.push(outcome);
        }

        outcomes.sort_by_key(|o| o.local_rank);
        let report = LaunchReport {
            mode: LaunchMode::FanOut,
            outcomes,
        };
        info!(
            workers = report.outcomes.len(),
            failed = ?report.failed_ranks(),
            "All workers terminated"
        );
        Ok(report)
    }
}

/// Wait for one worker, killing it if the launch is cancelled first
async fn supervise(
    local_rank: LocalRank,
    mut process: Box<dyn WorkerProcess>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<WorkerOutcome>,
) {
    let finished = tokio::select! {
        biased;
        exit = process.wait() => Some(exit),
        _ = cancel.cancelled() => None,
    };

    let exit = match finished {
        Some(Ok(exit)) => exit,
        Some(Err(e)) => WorkerExit::Errored {
            message: e.to_string(),
        },
        None => {
            info!(local_rank, pid = ?process.id(), "Terminating worker");
            match process.kill().await {
                Ok(()) => WorkerExit::Killed,
                Err(e) => {
                    warn!(local_rank, error = %e, "Failed to kill worker; waiting for it");
                    process.wait().await.unwrap_or_else(|e| WorkerExit::Errored {
                        message: e.to_string(),
                    })
                }
            }
        }
    };

    let _ = tx.send(WorkerOutcome { local_rank, exit });
}
