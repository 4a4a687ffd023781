//! Per-slot worker state tracking

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use launch_core::LocalRank;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::WorkerExit;

/// Worker slot state enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SlotState {
    /// Context built, process not yet started
    Pending,

    /// Worker is running
    Running,

    /// Worker exited successfully
    Succeeded,

    /// Worker exited with an error
    Failed,

    /// Worker was terminated by the launcher
    Killed,

    /// Worker process could not be started
    SpawnFailed,
}

impl SlotState {
    /// Returns true once the slot has reached a final state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SlotState::Pending | SlotState::Running)
    }
}

impl From<&WorkerExit> for SlotState {
    fn from(exit: &WorkerExit) -> Self {
        match exit {
            WorkerExit::Success => SlotState::Succeeded,
            WorkerExit::Failed { .. } | WorkerExit::Errored { .. } => SlotState::Failed,
            WorkerExit::Killed => SlotState::Killed,
            WorkerExit::SpawnFailed { .. } => SlotState::SpawnFailed,
        }
    }
}

/// Slot information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub local_rank: LocalRank,

    /// OS process id, unset for inline workers
    pub pid: Option<u32>,

    pub state: SlotState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit: Option<WorkerExit>,
}

impl SlotInfo {
    fn new(local_rank: LocalRank) -> Self {
        Self {
            local_rank,
            pid: None,
            state: SlotState::Pending,
            started_at: None,
            finished_at: None,
            exit: None,
        }
    }
}

/// Thread-safe table of the worker slots of one launch
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: DashMap<LocalRank, SlotInfo>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending slot, replacing any previous entry for the rank
    pub fn register(&self, local_rank: LocalRank) {
        self.slots.insert(local_rank, SlotInfo::new(local_rank));
    }

    pub fn mark_running(&self, local_rank: LocalRank, pid: Option<u32>) {
        let mut slot = self
            .slots
            .entry(local_rank)
            .or_insert_with(|| SlotInfo::new(local_rank));
        slot.pid = pid;
        slot.state = SlotState::Running;
        slot.started_at = Some(Utc::now());
    }

    /// Record the final state of a slot
    pub fn finish(&self, local_rank: LocalRank, exit: WorkerExit) {
        let mut slot = self
            .slots
            .entry(local_rank)
            .or_insert_with(|| SlotInfo::new(local_rank));
        slot.state = SlotState::from(&exit);
        slot.finished_at = Some(Utc::now());

        if exit.is_success() {
            info!(local_rank, pid = ?slot.pid, "Worker finished");
        } else {
            warn!(local_rank, pid = ?slot.pid, exit = ?exit, "Worker did not finish cleanly");
        }
        slot.exit = Some(exit);
    }

    pub fn get(&self, local_rank: LocalRank) -> Option<SlotInfo> {
        self.slots.get(&local_rank).map(|s| s.clone())
    }

    /// Ranks of slots still running
    pub fn running(&self) -> Vec<LocalRank> {
        let mut ranks: Vec<_> = self
            .slots
            .iter()
            .filter(|entry| entry.value().state == SlotState::Running)
            .map(|entry| *entry.key())
            .collect();
        ranks.sort_unstable();
        ranks
    }

    /// All slots ordered by local rank
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let mut slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|s| s.local_rank);
        slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

/// Thread-safe handle to a slot table
pub type SlotTableHandle = Arc<SlotTable>;
