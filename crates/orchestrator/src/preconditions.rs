//! Filesystem preconditions shared by all workers of a fan-out

use std::path::PathBuf;

use async_trait::async_trait;
use dataset_cache::{ensure_dataset_available, prepare_folders};
use launch_core::{Result, RunConfiguration};
use tracing::debug;
use worker_pool::SharedPreconditions;

/// Output folder tree and dataset source directory of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilesystem {
    pub save_dir: PathBuf,
    pub base_folders: Vec<String>,
    pub dataset: String,
    pub data_dir: Option<PathBuf>,
}

impl RunFilesystem {
    pub fn from_config(config: &RunConfiguration) -> Self {
        Self {
            save_dir: config.run.save_dir.clone(),
            base_folders: config.misc.base_folders.clone(),
            dataset: config.data.name.clone(),
            data_dir: config.run.data_dir.clone(),
        }
    }
}

#[async_trait]
impl SharedPreconditions for RunFilesystem {
    async fn prepare(&self) -> Result<()> {
        prepare_folders(&self.save_dir, &self.base_folders).await?;
        let availability = ensure_dataset_available(&self.dataset, self.data_dir.as_deref()).await?;
        debug!(dataset = %self.dataset, availability = %availability, "Shared preconditions done");
        Ok(())
    }
}
