//! Dataset preparation gate
//!
//! Runs once, before any worker exists, and fixes the preprocessing
//! parameters every worker of the run will use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use launch_core::config::DataSection;
use launch_core::{DatasetCacheHandle, Result, RunConfiguration};
use tracing::info;

use crate::{BuildRequest, DatasetBuilder};

/// Preprocessing parameters implied by the denylist
///
/// Datasets listed in `no_proc_data` are used as they are; every other
/// dataset is cropped to its long edge and resized to `img_size`.
pub fn preprocessing_for(name: &str, img_size: u32, no_proc_data: &[String]) -> (bool, Option<u32>) {
    if no_proc_data.iter().any(|n| n == name) {
        (false, None)
    } else {
        (true, Some(img_size))
    }
}

/// Decides and performs the one-time dataset preparation of a run
pub struct DatasetPreparationGate {
    builder: Arc<dyn DatasetBuilder>,

    /// Directory bundles are written to
    output_dir: PathBuf,
}

impl DatasetPreparationGate {
    /// Create a gate writing bundles under `<save_dir>/data`
    pub fn new<P: AsRef<Path>>(builder: Arc<dyn DatasetBuilder>, save_dir: P) -> Self {
        Self {
            builder,
            output_dir: save_dir.as_ref().join("data"),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Prepare the dataset of a reconciled configuration
    pub async fn prepare_for(&self, config: &RunConfiguration) -> Result<DatasetCacheHandle> {
        self.prepare(
            &config.data,
            config.run.data_dir.as_deref(),
            &config.misc.no_proc_data,
            config.run.load_train_hdf5,
        )
        .await
    }

    /// Compute the shared preprocessing parameters and, if `wants_cached`,
    /// build or reuse the dataset bundle.
    ///
    /// Without a cached format no filesystem access happens and the handle
    /// carries no path.
    pub async fn prepare(
        &self,
        data: &DataSection,
        data_dir: Option<&Path>,
        no_proc_data: &[String],
        wants_cached: bool,
    ) -> Result<DatasetCacheHandle> {
        let (crop_long_edge, resize_size) =
            preprocessing_for(&data.name, data.img_size, no_proc_data);

        if !wants_cached {
            info!(
                dataset = %data.name,
                crop_long_edge,
                resize_size = ?resize_size,
                "Using dataset without cached bundle"
            );
            return Ok(DatasetCacheHandle::uncached(crop_long_edge, resize_size));
        }

        let request = BuildRequest {
            name: &data.name,
            img_size: data.img_size,
            crop_long_edge,
            resize_size,
            output_dir: &self.output_dir,
            data_dir,
            data,
        };
        let built = self.builder.build_cache(&request).await?;

        info!(
            dataset = %data.name,
            path = %built.path.display(),
            reused = built.reused,
            crop_long_edge = built.crop_long_edge,
            resize_size = ?built.resize_size,
            "Dataset bundle ready"
        );

        Ok(DatasetCacheHandle {
            path: Some(built.path),
            crop_long_edge: built.crop_long_edge,
            resize_size: built.resize_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuiltCache, PackedBundleBuilder};
    use async_trait::async_trait;
    use launch_core::{DataPrepError, Error};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts build calls, never touches the filesystem
    #[derive(Default)]
    struct CountingBuilder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DatasetBuilder for CountingBuilder {
        async fn build_cache(&self, request: &BuildRequest<'_>) -> Result<BuiltCache> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BuiltCache {
                path: request.output_dir.join("fake.bundle"),
                crop_long_edge: request.crop_long_edge,
                resize_size: request.resize_size,
                reused: false,
            })
        }
    }

    struct FailingBuilder;

    #[async_trait]
    impl DatasetBuilder for FailingBuilder {
        async fn build_cache(&self, _request: &BuildRequest<'_>) -> Result<BuiltCache> {
            Err(DataPrepError::Build {
                message: "no space left on device".to_string(),
            }
            .into())
        }
    }

    fn data(name: &str, img_size: u32) -> DataSection {
        DataSection {
            name: name.to_string(),
            img_size,
            num_classes: None,
            source_preprocessed: false,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_denylist_parameters() {
        let deny = vec!["Tiny_ImageNet".to_string()];
        assert_eq!(preprocessing_for("CIFAR10", 32, &deny), (true, Some(32)));
        assert_eq!(preprocessing_for("Tiny_ImageNet", 64, &deny), (false, None));
    }

    #[tokio::test]
    async fn test_uncached_never_builds() {
        let builder = Arc::new(CountingBuilder::default());
        let gate = DatasetPreparationGate::new(builder.clone(), "/nonexistent");

        for _ in 0..2 {
            let handle = gate
                .prepare(&data("CIFAR10", 32), None, &[], false)
                .await
                .unwrap();
            assert_eq!(handle, DatasetCacheHandle::uncached(true, Some(32)));
        }
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_returns_builder_parameters() {
        let builder = Arc::new(CountingBuilder::default());
        let gate = DatasetPreparationGate::new(builder.clone(), "/runs");

        let deny = vec!["CUB200".to_string()];
        let handle = gate
            .prepare(&data("CUB200", 128), None, &deny, true)
            .await
            .unwrap();
        assert_eq!(handle.path, Some(PathBuf::from("/runs/data/fake.bundle")));
        assert!(!handle.crop_long_edge);
        assert_eq!(handle.resize_size, None);
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_failure_is_data_prep_error() {
        let gate = DatasetPreparationGate::new(Arc::new(FailingBuilder), "/runs");
        let err = gate
            .prepare(&data("CIFAR10", 32), None, &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataPrep(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_cifar10_scenario_builds_then_hits_cache() {
        let src = TempDir::new().unwrap();
        let save = TempDir::new().unwrap();
        let train = src.path().join("CIFAR10").join("train").join("airplane");
        std::fs::create_dir_all(&train).unwrap();
        std::fs::write(train.join("0001.png"), b"pixels").unwrap();

        let gate = DatasetPreparationGate::new(Arc::new(PackedBundleBuilder::new()), save.path());
        let cifar = data("CIFAR10", 32);

        let first = gate
            .prepare(&cifar, Some(src.path()), &[], true)
            .await
            .unwrap();
        assert!(first.path.is_some());
        assert!(first.crop_long_edge);
        assert_eq!(first.resize_size, Some(32));
        assert!(first.path.as_ref().unwrap().starts_with(save.path().join("data")));

        let modified = std::fs::metadata(first.path.as_ref().unwrap())
            .unwrap()
            .modified()
            .unwrap();
        let second = gate
            .prepare(&cifar, Some(src.path()), &[], true)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            std::fs::metadata(second.path.as_ref().unwrap())
                .unwrap()
                .modified()
                .unwrap(),
            modified
        );
    }
}
