//! Shared filesystem preconditions of a run
//!
//! Both steps run once on the launching process, never per worker.

use std::fmt;
use std::path::Path;

use launch_core::{Error, Result};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Whether a dataset's source directory is present locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetAvailability {
    /// `<data_dir>/<name>` exists
    Present,

    /// Not present; the data directory was created for workers to fill
    Missing,

    /// No data directory configured
    NotConfigured,
}

impl fmt::Display for DatasetAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetAvailability::Present => write!(f, "present locally"),
            DatasetAvailability::Missing => write!(
                f,
                "not found locally and automatic download is not supported; workers must fetch it"
            ),
            DatasetAvailability::NotConfigured => write!(f, "no data directory configured"),
        }
    }
}

/// Create `<save_dir>/<name>` for every shared output folder
#[instrument(skip(names))]
pub async fn prepare_folders(save_dir: &Path, names: &[String]) -> Result<()> {
    for name in names {
        let dir = save_dir.join(name);
        fs::create_dir_all(&dir).await.map_err(|e| Error::Internal {
            message: format!("Failed to create directory {:?}: {}", dir, e),
        })?;
        debug!(dir = %dir.display(), "Prepared output folder");
    }
    info!(save_dir = %save_dir.display(), count = names.len(), "Output folders ready");
    Ok(())
}

/// Check that the dataset's source data is present under `data_dir`
#[instrument]
pub async fn ensure_dataset_available(
    name: &str,
    data_dir: Option<&Path>,
) -> Result<DatasetAvailability> {
    let Some(data_dir) = data_dir else {
        return Ok(DatasetAvailability::NotConfigured);
    };

    let dataset_dir = data_dir.join(name);
    if fs::metadata(&dataset_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Ok(DatasetAvailability::Present);
    }

    fs::create_dir_all(data_dir).await?;
    let availability = DatasetAvailability::Missing;
    warn!(
        dataset = name,
        dir = %dataset_dir.display(),
        "Dataset {availability}"
    );
    Ok(availability)
}
