//! Core type definitions shared by the gate, the worker pool and the CLI

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Result, RunConfiguration, SeedSelection, TopologyDescriptor};

/// Identifier types
pub type RunName = String;
pub type LocalRank = usize;

/// Environment variable carrying a serialized [`WorkerContext`]
pub const WORKER_CONTEXT_ENV: &str = "LAUNCH_WORKER_CONTEXT";

/// Location and preprocessing contract of the shared dataset bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCacheHandle {
    /// Set only when a bundle was built or reused
    pub path: Option<PathBuf>,

    /// Whether workers crop samples to their long edge
    pub crop_long_edge: bool,

    /// Target resolution workers resize samples to
    pub resize_size: Option<u32>,
}

impl DatasetCacheHandle {
    pub fn uncached(crop_long_edge: bool, resize_size: Option<u32>) -> Self {
        Self {
            path: None,
            crop_long_edge,
            resize_size,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.path.is_some()
    }
}

/// Everything one worker is started with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub local_rank: LocalRank,
    pub global_rank: usize,
    pub world_size: usize,
    pub current_node: usize,
    pub total_nodes: usize,
    pub run_name: RunName,
    pub seed: SeedSelection,
    pub dataset: DatasetCacheHandle,
    pub config: RunConfiguration,
}

impl WorkerContext {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Conventional distributed-training environment for this worker
    pub fn rank_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("LOCAL_RANK", self.local_rank.to_string()),
            ("RANK", self.global_rank.to_string()),
            ("WORLD_SIZE", self.world_size.to_string()),
            ("NODE_RANK", self.current_node.to_string()),
            (
                "LOCAL_WORLD_SIZE",
                (self.world_size / self.total_nodes.max(1)).to_string(),
            ),
        ];
        env.extend(self.seed.env_vars());
        env
    }
}

/// State shared by every worker of a run, finalized before the first spawn
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub config: Arc<RunConfiguration>,
    pub topology: TopologyDescriptor,
    pub seed: SeedSelection,
    pub run_name: RunName,
    pub dataset: DatasetCacheHandle,
}

impl LaunchPlan {
    /// Context for the worker on `local_rank` of this node
    pub fn context(&self, local_rank: LocalRank) -> WorkerContext {
        WorkerContext {
            local_rank,
            global_rank: self.topology.global_rank(local_rank),
            world_size: self.topology.world_size,
            current_node: self.topology.current_node,
            total_nodes: self.topology.total_nodes,
            run_name: self.run_name.clone(),
            seed: self.seed,
            dataset: self.dataset.clone(),
            config: (*self.config).clone(),
        }
    }

    pub fn distributed(&self) -> bool {
        self.config.run.distributed_data_parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::reconcile_str;
    use crate::{select_seed, FixedTopology, Overrides};
    use std::path::Path;

    fn plan() -> LaunchPlan {
        let config = reconcile_str(
            "[DATA]\nname = \"CIFAR10\"\nimg_size = 32\n",
            Path::new("ContraGAN.toml"),
            &Overrides::new()
                .with("train", true)
                .with("data_dir", "/data")
                .with("total_nodes", 2)
                .with("current_node", 1),
            &FixedTopology::new(4, 0),
        )
        .unwrap();
        let topology = TopologyDescriptor::from_config(&config, 0).unwrap();

        LaunchPlan {
            config: Arc::new(config),
            topology,
            seed: select_seed(11).unwrap(),
            run_name: "ContraGAN-train-x".to_string(),
            dataset: DatasetCacheHandle::uncached(true, Some(32)),
        }
    }

    #[test]
    fn test_context_ranks() {
        let ctx = plan().context(2);
        assert_eq!(ctx.local_rank, 2);
        assert_eq!(ctx.global_rank, 6);
        assert_eq!(ctx.world_size, 8);

        let env = ctx.rank_env();
        assert!(env.contains(&("RANK", "6".to_string())));
        assert!(env.contains(&("LOCAL_WORLD_SIZE", "4".to_string())));
        assert!(env.contains(&("PYTHONHASHSEED", "11".to_string())));
    }

    #[test]
    fn test_context_json_round_trip() {
        let ctx = plan().context(1);
        let parsed = WorkerContext::from_json(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(parsed, ctx);
    }
}
