//! Command-line surface of the `launch` binary

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use launch_core::Overrides;

/// Single-dash long aliases and the option they stand for
const SHORT_ALIASES: &[(&str, &str)] = &[
    ("-cfg", "--cfg_file"),
    ("-data", "--data_dir"),
    ("-save", "--save_dir"),
    ("-ckpt", "--ckpt_dir"),
    ("-best", "--load_best"),
    ("-DDP", "--distributed_data_parallel"),
    ("-tn", "--total_nodes"),
    ("-cn", "--current_node"),
    ("-sync_bn", "--synchronized_bn"),
    ("-mpc", "--mixed_precision"),
    ("-batch_stat", "--batch_statistics"),
    ("-std_stat", "--standing_statistics"),
    ("-std_max", "--standing_max_batch"),
    ("-std_step", "--standing_step"),
    ("-hdf5", "--load_train_hdf5"),
    ("-knn", "--k_nearest_neighbor"),
    ("-itp", "--interpolation"),
    ("-fa", "--frequency_analysis"),
    ("-tsne", "--tsne_analysis"),
    ("-ifid", "--intra_class_fid"),
    ("-ref", "--ref_dataset"),
];

#[derive(Parser, Debug)]
#[command(name = "launch")]
#[command(about = "Launch GAN training and evaluation across local accelerators")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    // Entry point of re-executed worker processes
    #[command(hide = true)]
    Worker,
}

/// Options overlaid onto the `[RUN]` section
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Run configuration file
    #[arg(
        long = "cfg_file",
        default_value = "./configs/CIFAR10/ContraGAN.toml"
    )]
    pub cfg_file: PathBuf,

    /// Dataset root directory
    #[arg(long = "data_dir", env = "LAUNCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory for checkpoints, logs and samples
    #[arg(long = "save_dir")]
    pub save_dir: Option<PathBuf>,

    #[arg(long = "ckpt_dir")]
    pub ckpt_dir: Option<PathBuf>,

    /// Load the best checkpoint instead of the latest
    #[arg(long = "load_best")]
    pub load_best: bool,

    #[arg(long = "distributed_data_parallel")]
    pub distributed_data_parallel: bool,

    #[arg(long = "total_nodes")]
    pub total_nodes: Option<usize>,

    /// Index of this node, starting at 0
    #[arg(long = "current_node")]
    pub current_node: Option<usize>,

    /// Seed for all random generators; -1 draws one
    #[arg(long, allow_negative_numbers = true)]
    pub seed: Option<i64>,

    #[arg(long = "num_workers")]
    pub num_workers: Option<usize>,

    #[arg(long = "synchronized_bn")]
    pub synchronized_bn: bool,

    #[arg(long = "mixed_precision")]
    pub mixed_precision: bool,

    /// Truncation threshold for sampling; -1.0 disables it
    #[arg(long = "truncation_th", allow_negative_numbers = true)]
    pub truncation_th: Option<f64>,

    #[arg(long = "batch_statistics")]
    pub batch_statistics: bool,

    #[arg(long = "standing_statistics")]
    pub standing_statistics: bool,

    #[arg(long = "standing_max_batch", allow_negative_numbers = true)]
    pub standing_max_batch: Option<i64>,

    #[arg(long = "standing_step", allow_negative_numbers = true)]
    pub standing_step: Option<i64>,

    /// Number of generator blocks to freeze; -1 freezes none
    #[arg(long = "freezeG", allow_negative_numbers = true)]
    pub freeze_g: Option<i64>,

    /// Number of discriminator blocks to freeze; -1 freezes none
    #[arg(long = "freezeD", allow_negative_numbers = true)]
    pub freeze_d: Option<i64>,

    #[arg(short = 't', long = "train")]
    pub train: bool,

    #[arg(short = 'e', long = "eval")]
    pub eval: bool,

    #[arg(short = 's', long = "save_fake_images")]
    pub save_fake_images: bool,

    #[arg(short = 'v', long = "vis_fake_images")]
    pub vis_fake_images: bool,

    #[arg(long = "k_nearest_neighbor")]
    pub k_nearest_neighbor: bool,

    #[arg(long = "interpolation")]
    pub interpolation: bool,

    #[arg(long = "frequency_analysis")]
    pub frequency_analysis: bool,

    #[arg(long = "tsne_analysis")]
    pub tsne_analysis: bool,

    #[arg(long = "intra_class_fid")]
    pub intra_class_fid: bool,

    /// Pack the training split into a cached bundle before launch
    #[arg(long = "load_train_hdf5")]
    pub load_train_hdf5: bool,

    /// Load the cached bundle into memory; requires --load_train_hdf5
    #[arg(short = 'l', long = "load_data_in_memory")]
    pub load_data_in_memory: bool,

    #[arg(long = "print_every")]
    pub print_every: Option<u64>,

    #[arg(long = "save_every")]
    pub save_every: Option<u64>,

    /// Feature extractor for evaluation metrics [Inception_V3, SwAV]
    #[arg(long = "eval_backbone")]
    pub eval_backbone: Option<String>,

    /// Reference split for evaluation [train, valid, test]
    #[arg(long = "ref_dataset")]
    pub ref_dataset: Option<String>,

    /// Kill the remaining workers as soon as one fails
    #[arg(long = "abort_on_failure")]
    pub abort_on_failure: bool,

    /// Template for the run name
    #[arg(long = "run_name_template")]
    pub run_name_template: Option<String>,
}

impl Cli {
    /// Parse arguments, accepting the single-dash long aliases
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(normalize_args(args))
    }

    pub fn help() -> String {
        Self::command().render_help().to_string()
    }
}

impl RunArgs {
    /// Returns true if at least one operating mode flag was given
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

    /// Options given on the command line, keyed by their `[RUN]` field
    ///
    /// Flags that were not passed are left out so that values from the
    /// configuration file survive.
    pub fn to_overrides(&self) -> Overrides {
        let mut overrides = Overrides::new();

        let paths = [
            ("data_dir", &self.data_dir),
            ("save_dir", &self.save_dir),
            ("ckpt_dir", &self.ckpt_dir),
        ];
        for (key, value) in paths {
            if let Some(path) = value {
                overrides.set(key, path.to_string_lossy().into_owned());
            }
        }

        let flags = [
            ("load_best", self.load_best),
            ("distributed_data_parallel", self.distributed_data_parallel),
            ("synchronized_bn", self.synchronized_bn),
            ("mixed_precision", self.mixed_precision),
            ("batch_statistics", self.batch_statistics),
            ("standing_statistics", self.standing_statistics),
            ("train", self.train),
            ("eval", self.eval),
            ("save_fake_images", self.save_fake_images),
            ("vis_fake_images", self.vis_fake_images),
            ("k_nearest_neighbor", self.k_nearest_neighbor),
            ("interpolation", self.interpolation),
            ("frequency_analysis", self.frequency_analysis),
            ("tsne_analysis", self.tsne_analysis),
            ("intra_class_fid", self.intra_class_fid),
            ("load_train_hdf5", self.load_train_hdf5),
            ("load_data_in_memory", self.load_data_in_memory),
            ("abort_on_failure", self.abort_on_failure),
        ];
        for (key, set) in flags {
            if set {
                overrides.set(key, true);
            }
        }

        let integers = [
            ("seed", self.seed),
            ("standing_max_batch", self.standing_max_batch),
            ("standing_step", self.standing_step),
            ("freezeG", self.freeze_g),
            ("freezeD", self.freeze_d),
        ];
        for (key, value) in integers {
            if let Some(value) = value {
                overrides.set(key, value);
            }
        }

        let counts = [
            ("total_nodes", self.total_nodes),
            ("current_node", self.current_node),
            ("num_workers", self.num_workers),
        ];
        for (key, value) in counts {
            if let Some(value) = value {
                overrides.set(key, value as u64);
            }
        }

        if let Some(every) = self.print_every {
            overrides.set("print_every", every);
        }
        if let Some(every) = self.save_every {
            overrides.set("save_every", every);
        }
        if let Some(th) = self.truncation_th {
            overrides.set("truncation_th", th);
        }
        if let Some(backbone) = &self.eval_backbone {
            overrides.set("eval_backbone", backbone.as_str());
        }
        if let Some(reference) = &self.ref_dataset {
            overrides.set("ref_dataset", reference.as_str());
        }
        if let Some(template) = &self.run_name_template {
            overrides.set("run_name_template", template.as_str());
        }

        overrides
    }
}

/// Rewrite single-dash long aliases (`-cfg`, `-DDP`, ...) to their
/// double-dash form. Arguments after `--` are left alone.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut rest = false;
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if rest {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                rest = true;
                return arg;
            }
            let (flag, value) = match text.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (text, None),
            };
            match SHORT_ALIASES.iter().find(|(alias, _)| *alias == flag) {
                Some((_, long)) => match value {
                    Some(value) => OsString::from(format!("{long}={value}")),
                    None => OsString::from(*long),
                },
                None => arg,
            }
        })
        .collect()
}
