//! Run configuration types and reconciliation
//!
//! A run configuration is loaded from a TOML file whose top-level tables are
//! upper-case sections (`[RUN]`, `[DATA]`, `[OPTIMIZATION]`, `[MISC]`,
//! `[WORKER]`). Sections the launcher does not read (`[MODEL]`, `[LOSS]`,
//! `[PRE]`, ...) are carried through to the workers untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::run_name::DEFAULT_RUN_NAME_TEMPLATE;
use crate::{compat, DatasetCacheHandle, Error, HostTopologyProvider, Result, SeedSelection};

/// Output folders created under the save directory before fan-out
pub const DEFAULT_BASE_FOLDERS: [&str; 6] =
    ["checkpoints", "figures", "logs", "moments", "samples", "values"];

/// Fully reconciled configuration of one training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfiguration {
    /// Run-time options, overlaid from the command line
    #[serde(rename = "RUN", default)]
    pub run: RunSection,

    /// Dataset settings
    #[serde(rename = "DATA")]
    pub data: DataSection,

    /// Optimization settings; `world_size` is derived at reconciliation
    #[serde(rename = "OPTIMIZATION", default)]
    pub optimization: OptimizationSection,

    /// Miscellaneous launcher settings
    #[serde(rename = "MISC", default)]
    pub misc: MiscSection,

    /// External trainer program
    #[serde(rename = "WORKER", default)]
    pub worker: WorkerSection,

    /// Sections only the workers read
    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

impl RunConfiguration {
    /// Write the seed and preprocessing a run actually uses back into the
    /// configuration workers receive
    ///
    /// `RUN.seed` becomes the drawn seed and `[PRE]` gains the realized
    /// `crop_long_edge` and `resize_size`.
    pub fn record_effective(
        &mut self,
        seed: &SeedSelection,
        dataset: &DatasetCacheHandle,
    ) -> Result<()> {
        self.run.seed = i64::try_from(seed.seed)
            .map_err(|_| Error::config(&["RUN.seed"], format!("seed {} is out of range", seed.seed)))?;

        let pre = self
            .sections
            .entry("PRE".to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| Error::config(&["PRE"], "[PRE] is not a table"))?;
        pre.insert(
            "crop_long_edge".to_string(),
            Value::Bool(dataset.crop_long_edge),
        );
        pre.insert(
            "resize_size".to_string(),
            dataset.resize_size.map_or(Value::Null, Value::from),
        );
        Ok(())
    }
}

/// `[RUN]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub cfg_file: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub save_dir: PathBuf,
    pub ckpt_dir: Option<PathBuf>,
    pub load_best: bool,

    pub distributed_data_parallel: bool,
    pub total_nodes: usize,
    pub current_node: usize,

    /// Requested seed; -1 draws one at launch
    pub seed: i64,
    pub num_workers: usize,
    pub synchronized_bn: bool,
    pub mixed_precision: bool,

    pub truncation_th: f64,
    pub batch_statistics: bool,
    pub standing_statistics: bool,
    pub standing_max_batch: i64,
    pub standing_step: i64,
    #[serde(rename = "freezeG")]
    pub freeze_g: i64,
    #[serde(rename = "freezeD")]
    pub freeze_d: i64,

    // Operating modes
    pub train: bool,
    pub eval: bool,
    pub save_fake_images: bool,
    pub vis_fake_images: bool,
    pub k_nearest_neighbor: bool,
    pub interpolation: bool,
    pub frequency_analysis: bool,
    pub tsne_analysis: bool,
    pub intra_class_fid: bool,

    pub load_train_hdf5: bool,
    pub load_data_in_memory: bool,

    pub print_every: u64,
    pub save_every: u64,
    pub eval_backbone: String,
    pub ref_dataset: String,

    /// Kill surviving workers once one of them fails
    pub abort_on_failure: bool,
    pub run_name_template: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            cfg_file: PathBuf::from("./configs/CIFAR10/ContraGAN.toml"),
            data_dir: None,
            save_dir: PathBuf::from("./"),
            ckpt_dir: None,
            load_best: false,
            distributed_data_parallel: false,
            total_nodes: 1,
            current_node: 0,
            seed: -1,
            num_workers: 8,
            synchronized_bn: false,
            mixed_precision: false,
            truncation_th: -1.0,
            batch_statistics: false,
            standing_statistics: false,
            standing_max_batch: -1,
            standing_step: -1,
            freeze_g: -1,
            freeze_d: -1,
            train: false,
            eval: false,
            save_fake_images: false,
            vis_fake_images: false,
            k_nearest_neighbor: false,
            interpolation: false,
            frequency_analysis: false,
            tsne_analysis: false,
            intra_class_fid: false,
            load_train_hdf5: false,
            load_data_in_memory: false,
            print_every: 100,
            save_every: 2000,
            eval_backbone: "Inception_V3".to_string(),
            ref_dataset: "train".to_string(),
            abort_on_failure: false,
            run_name_template: DEFAULT_RUN_NAME_TEMPLATE.to_string(),
        }
    }
}

impl RunSection {
    /// Returns true if at least one operating mode is selected
    pub fn has_operating_mode(&self) -> bool {
        self.train
            || self.eval
            || self.save_fake_images
            || self.vis_fake_images
            || self.k_nearest_neighbor
            || self.interpolation
            || self.frequency_analysis
            || self.tsne_analysis
            || self.intra_class_fid
    }

    /// Phase tag used in the run name
    pub fn phase(&self) -> &'static str {
        if self.train {
            "train"
        } else {
            "eval"
        }
    }

    /// Config file stem, used as the framework tag of the run name
    pub fn framework(&self) -> String {
        self.cfg_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string())
    }
}

/// `[DATA]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSection {
    pub name: String,
    pub img_size: u32,

    #[serde(default)]
    pub num_classes: Option<u32>,

    /// Source samples are already cropped and resized
    #[serde(default)]
    pub source_preprocessed: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `[OPTIMIZATION]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizationSection {
    #[serde(default)]
    pub world_size: usize,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `[MISC]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MiscSection {
    /// Datasets that skip long-edge cropping and resizing
    #[serde(default)]
    pub no_proc_data: Vec<String>,

    #[serde(default = "default_base_folders")]
    pub base_folders: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for MiscSection {
    fn default() -> Self {
        Self {
            no_proc_data: Vec::new(),
            base_folders: default_base_folders(),
            extra: BTreeMap::new(),
        }
    }
}

fn default_base_folders() -> Vec<String> {
    DEFAULT_BASE_FOLDERS.iter().map(|s| s.to_string()).collect()
}

/// `[WORKER]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    /// Trainer executable started once per worker
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Flat mapping of command-line overrides for the `[RUN]` section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    values: Map<String, Value>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an override, replacing any previous value for the key
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style variant of [`Overrides::set`]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Load `source`, overlay `overrides` onto `[RUN]`, derive the world size and
/// run the compatibility check.
///
/// The only ambient input is the accelerator count reported by `host`.
pub fn reconcile(
    source: &Path,
    overrides: &Overrides,
    host: &dyn HostTopologyProvider,
) -> Result<RunConfiguration> {
    let contents = std::fs::read_to_string(source).map_err(|e| Error::ConfigSource {
        path: source.to_path_buf(),
        message: e.to_string(),
    })?;
    reconcile_str(&contents, source, overrides, host)
}

/// [`reconcile`] over already loaded TOML text
pub fn reconcile_str(
    contents: &str,
    source: &Path,
    overrides: &Overrides,
    host: &dyn HostTopologyProvider,
) -> Result<RunConfiguration> {
    let source_err = |message: String| Error::ConfigSource {
        path: source.to_path_buf(),
        message,
    };

    let base: toml::Table = toml::from_str(contents).map_err(|e| source_err(e.to_string()))?;
    let mut tree = serde_json::to_value(base).map_err(|e| source_err(e.to_string()))?;

    let root = tree
        .as_object_mut()
        .ok_or_else(|| source_err("top level is not a table".to_string()))?;
    let run = root
        .entry("RUN")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| source_err("[RUN] is not a table".to_string()))?;

    for (key, value) in overrides.iter() {
        debug!(key = %key, value = %value, "Applying RUN override");
        run.insert(key.clone(), value.clone());
    }
    run.insert(
        "cfg_file".to_string(),
        Value::String(source.to_string_lossy().into_owned()),
    );

    let mut config: RunConfiguration =
        serde_json::from_value(tree).map_err(|e| source_err(e.to_string()))?;

    let accelerators = host.accelerator_count();
    config.optimization.world_size = accelerators
        .checked_mul(config.run.total_nodes)
        .ok_or_else(|| {
            Error::config(
                &["RUN.total_nodes", "OPTIMIZATION.world_size"],
                format!(
                    "{accelerators} accelerators on {} nodes overflows the world size",
                    config.run.total_nodes
                ),
            )
        })?;

    compat::check(&config)?;

    info!(
        cfg_file = %source.display(),
        dataset = %config.data.name,
        accelerators_per_node = accelerators,
        total_nodes = config.run.total_nodes,
        world_size = config.optimization.world_size,
        "Configuration reconciled"
    );

    Ok(config)
}
