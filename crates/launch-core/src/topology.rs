//! Parallelism topology and host accelerator discovery

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result, RunConfiguration};

/// Overrides accelerator discovery
pub const NUM_ACCELERATORS_ENV: &str = "LAUNCH_NUM_ACCELERATORS";

const NVIDIA_GPU_DIR: &str = "/proc/driver/nvidia/gpus";

/// Source of the host's accelerator inventory
///
/// Abstracted so the launcher can be exercised without accelerator hardware.
pub trait HostTopologyProvider: Send + Sync {
    /// Number of accelerators visible to this process
    fn accelerator_count(&self) -> usize;

    /// Index of the accelerator this process is bound to
    fn current_device(&self) -> usize;
}

/// Host topology discovered from the environment
///
/// Resolution order: `LAUNCH_NUM_ACCELERATORS`, then `CUDA_VISIBLE_DEVICES`,
/// then the NVIDIA driver's procfs entries. The current device is taken
/// from `LOCAL_RANK` and defaults to 0.
#[derive(Debug, Clone)]
pub struct SystemTopology {
    gpu_dir: PathBuf,
}

impl SystemTopology {
    pub fn new() -> Self {
        Self {
            gpu_dir: PathBuf::from(NVIDIA_GPU_DIR),
        }
    }

    /// Use a different driver directory, for hosts that mount procfs elsewhere
    pub fn with_gpu_dir<P: AsRef<Path>>(gpu_dir: P) -> Self {
        Self {
            gpu_dir: gpu_dir.as_ref().to_path_buf(),
        }
    }

    fn count_from_env(
        explicit: Option<String>,
        visible_devices: Option<String>,
    ) -> Option<usize> {
        if let Some(n) = explicit.and_then(|v| v.trim().parse().ok()) {
            return Some(n);
        }
        visible_devices.map(|v| v.split(',').filter(|d| !d.trim().is_empty()).count())
    }

    fn count_driver_entries(&self) -> usize {
        std::fs::read_dir(&self.gpu_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}

impl Default for SystemTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTopologyProvider for SystemTopology {
    fn accelerator_count(&self) -> usize {
        let count = Self::count_from_env(
            std::env::var(NUM_ACCELERATORS_ENV).ok(),
            std::env::var("CUDA_VISIBLE_DEVICES").ok(),
        )
        .unwrap_or_else(|| self.count_driver_entries());
        debug!(count, "Detected accelerators");
        count
    }

    fn current_device(&self) -> usize {
        std::env::var("LOCAL_RANK")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Fixed accelerator inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTopology {
    accelerators: usize,
    current: usize,
}

impl FixedTopology {
    pub fn new(accelerators: usize, current: usize) -> Self {
        Self {
            accelerators,
            current,
        }
    }
}

impl HostTopologyProvider for FixedTopology {
    fn accelerator_count(&self) -> usize {
        self.accelerators
    }

    fn current_device(&self) -> usize {
        self.current
    }
}

/// Shape of one run across nodes and accelerators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub total_nodes: usize,
    pub current_node: usize,
    pub accelerators_per_node: usize,
    pub world_size: usize,

    /// Accelerator index of the launching process
    pub current_accelerator: usize,
}

impl TopologyDescriptor {
    pub fn new(
        total_nodes: usize,
        current_node: usize,
        accelerators_per_node: usize,
        current_accelerator: usize,
    ) -> Result<Self> {
        if total_nodes == 0 {
            return Err(Error::config(&["RUN.total_nodes"], "at least one node is required"));
        }
        if current_node >= total_nodes {
            return Err(Error::config(
                &["RUN.current_node", "RUN.total_nodes"],
                format!("current node {current_node} out of range for {total_nodes} node(s)"),
            ));
        }
        let world_size = accelerators_per_node * total_nodes;
        if world_size == 0 {
            return Err(Error::config(
                &["OPTIMIZATION.world_size"],
                "no accelerator detected; world size must be at least 1",
            ));
        }
        Ok(Self {
            total_nodes,
            current_node,
            accelerators_per_node,
            world_size,
            current_accelerator,
        })
    }

    /// Topology of a reconciled configuration
    pub fn from_config(config: &RunConfiguration, current_accelerator: usize) -> Result<Self> {
        let nodes = config.run.total_nodes.max(1);
        Self::new(
            config.run.total_nodes,
            config.run.current_node,
            config.optimization.world_size / nodes,
            current_accelerator,
        )
    }

    /// Global rank of a local accelerator slot on this node
    pub fn global_rank(&self, local_rank: usize) -> usize {
        self.current_node * self.accelerators_per_node + local_rank
    }

    /// Local ranks of the worker slots on this node
    pub fn local_slots(&self) -> std::ops::Range<usize> {
        0..self.accelerators_per_node
    }

    pub fn is_degenerate(&self) -> bool {
        self.world_size == 1
    }
}
