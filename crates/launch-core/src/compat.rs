//! Cross-field compatibility rules over a merged configuration

use std::fmt;
use std::str::FromStr;

use crate::{ConfigViolation, Error, Result, RunConfiguration};

/// Backbone networks the evaluation metrics can be computed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalBackbone {
    InceptionV3,
    SwAV,
}

impl EvalBackbone {
    pub const ALL: [EvalBackbone; 2] = [EvalBackbone::InceptionV3, EvalBackbone::SwAV];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalBackbone::InceptionV3 => "Inception_V3",
            EvalBackbone::SwAV => "SwAV",
        }
    }
}

impl FromStr for EvalBackbone {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EvalBackbone::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = EvalBackbone::ALL.iter().map(|b| b.as_str()).collect();
                format!("unknown evaluation backbone {s:?}, expected one of {known:?}")
            })
    }
}

impl fmt::Display for EvalBackbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dataset splits usable as the evaluation reference
pub const REF_DATASETS: [&str; 3] = ["train", "valid", "test"];

/// Validate the merged configuration, reporting every violated rule at once
pub fn check(config: &RunConfiguration) -> Result<()> {
    let violations = violations(config);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Config { violations })
    }
}

/// Collect all violated rules without failing
pub fn violations(config: &RunConfiguration) -> Vec<ConfigViolation> {
    let run = &config.run;
    let world_size = config.optimization.world_size;
    let mut out = Vec::new();
    let mut rule = |ok: bool, fields: &[&str], message: &str| {
        if !ok {
            out.push(ConfigViolation::new(fields, message));
        }
    };

    rule(
        run.total_nodes >= 1,
        &["RUN.total_nodes"],
        "at least one node is required",
    );
    rule(
        run.current_node < run.total_nodes.max(1),
        &["RUN.current_node", "RUN.total_nodes"],
        "current node index must be smaller than the number of nodes",
    );
    rule(
        world_size >= 1,
        &["OPTIMIZATION.world_size"],
        "no accelerator detected; world size must be at least 1",
    );
    rule(
        !run.synchronized_bn || world_size > 1,
        &["RUN.synchronized_bn", "OPTIMIZATION.world_size"],
        "synchronized batch norm requires a world size greater than 1",
    );
    rule(
        run.eval_backbone.parse::<EvalBackbone>().is_ok(),
        &["RUN.eval_backbone"],
        "must be one of Inception_V3, SwAV",
    );
    rule(
        REF_DATASETS.contains(&run.ref_dataset.as_str()),
        &["RUN.ref_dataset"],
        "must be one of train, valid, test",
    );
    rule(
        !(run.batch_statistics && run.standing_statistics),
        &["RUN.batch_statistics", "RUN.standing_statistics"],
        "batch statistics and standing statistics are mutually exclusive",
    );
    rule(
        !run.standing_statistics || (run.standing_max_batch > 0 && run.standing_step > 0),
        &[
            "RUN.standing_statistics",
            "RUN.standing_max_batch",
            "RUN.standing_step",
        ],
        "standing statistics need a positive max batch and step count",
    );
    rule(
        !run.load_data_in_memory || run.load_train_hdf5,
        &["RUN.load_data_in_memory", "RUN.load_train_hdf5"],
        "loading data in memory requires the cached train bundle",
    );

    if run.distributed_data_parallel {
        let single_process = [
            ("RUN.vis_fake_images", run.vis_fake_images),
            ("RUN.k_nearest_neighbor", run.k_nearest_neighbor),
            ("RUN.interpolation", run.interpolation),
            ("RUN.frequency_analysis", run.frequency_analysis),
            ("RUN.tsne_analysis", run.tsne_analysis),
        ];
        for (field, enabled) in single_process {
            rule(
                !enabled,
                &["RUN.distributed_data_parallel", field],
                "analysis is not supported in distributed data parallel mode",
            );
        }
    }

    rule(
        !(run.train || run.eval) || run.data_dir.is_some(),
        &["RUN.data_dir"],
        "training and evaluation need a data directory",
    );
    rule(
        run.truncation_th == -1.0 || run.truncation_th > 0.0,
        &["RUN.truncation_th"],
        "truncation threshold must be -1 (disabled) or positive",
    );
    rule(run.freeze_g >= -1, &["RUN.freezeG"], "must be -1 or a block count");
    rule(run.freeze_d >= -1, &["RUN.freezeD"], "must be -1 or a block count");
    rule(run.print_every > 0, &["RUN.print_every"], "must be positive");
    rule(run.save_every > 0, &["RUN.save_every"], "must be positive");
    rule(run.seed >= -1, &["RUN.seed"], "must be -1 (random) or non-negative");
    rule(
        !config.data.name.is_empty(),
        &["DATA.name"],
        "dataset name is required",
    );
    rule(config.data.img_size > 0, &["DATA.img_size"], "must be positive");

    out
}
