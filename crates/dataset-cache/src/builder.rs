//! Dataset builder trait definition
//!
//! Defines the interface the preparation gate uses to materialize a
//! cached dataset bundle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use launch_core::config::DataSection;
use launch_core::Result;

/// Parameters of one bundle build
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub name: &'a str,
    pub img_size: u32,
    pub crop_long_edge: bool,
    pub resize_size: Option<u32>,

    /// Directory the bundle is written to
    pub output_dir: &'a Path,

    /// Directory holding the source data
    pub data_dir: Option<&'a Path>,

    /// Full `[DATA]` section
    pub data: &'a DataSection,
}

/// A bundle as realized on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCache {
    pub path: PathBuf,

    /// Preprocessing parameters recorded in the bundle
    pub crop_long_edge: bool,
    pub resize_size: Option<u32>,

    /// True if an existing bundle was reused instead of built
    pub reused: bool,
}

/// Async trait for dataset bundle builders
///
/// Implementors must never leave a partially written bundle at the path
/// they return, and must reuse a valid bundle already present there.
#[async_trait]
pub trait DatasetBuilder: Send + Sync {
    /// Build, or reuse, the bundle described by `request`
    ///
    /// # Errors
    /// Returns [`launch_core::Error::DataPrep`] if the source is missing or
    /// any I/O step fails
    async fn build_cache(&self, request: &BuildRequest<'_>) -> Result<BuiltCache>;
}
