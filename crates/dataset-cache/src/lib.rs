//! Dataset preparation for distributed training runs
//!
//! This crate provides:
//! - **Preparation gate** deciding the shared preprocessing parameters and
//!   whether a cached bundle has to be built before any worker starts
//! - **Packed bundles**, a random-access on-disk format written atomically
//!   and reused across runs
//! - **Shared folders** created once for the whole run
//!
//! # Example
//!
//! ```no_run
//! use dataset_cache::{DatasetPreparationGate, PackedBundleBuilder};
//! use std::sync::Arc;
//!
//! # async fn example(config: &launch_core::RunConfiguration) -> launch_core::Result<()> {
//! let gate = DatasetPreparationGate::new(Arc::new(PackedBundleBuilder::new()), "./runs");
//! let handle = gate.prepare_for(config).await?;
//! println!("bundle: {:?}", handle.path);
//! # Ok(())
//! # }
//! ```

mod builder;
mod bundle;
mod folders;
mod gate;

pub use builder::{BuildRequest, BuiltCache, DatasetBuilder};
pub use bundle::{BundleEntry, BundleHeader, PackedBundleBuilder, BUNDLE_MAGIC, BUNDLE_VERSION};
pub use folders::{ensure_dataset_available, prepare_folders, DatasetAvailability};
pub use gate::{preprocessing_for, DatasetPreparationGate};

// Re-export types from launch-core for convenience
pub use launch_core::types::DatasetCacheHandle;
