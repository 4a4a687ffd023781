//! End-to-end launch pipeline tests
//!
//! Runs the orchestrator against real configuration files and dataset
//! sources in temporary directories. Worker processes are faked so the
//! tests observe exactly what each worker would be started with.

use anyhow::Result;
use async_trait::async_trait;
use dataset_cache::PackedBundleBuilder;
use launch_core::{FixedTopology, WorkerContext};
use orchestrator::{exit_code, Cli, Orchestrator, RunArgs};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use worker_pool::{LaunchMode, WorkerEntry, WorkerExit, WorkerProcess, WorkerSpawner};

const CIFAR10: &str = r#"
[DATA]
name = "CIFAR10"
img_size = 32
num_classes = 10

[MODEL]
backbone = "big_resnet"
g_cond_mtd = "cBN"
d_cond_mtd = "PD"

[OPTIMIZATION]
batch_size = 64
total_steps = 100000
"#;

struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn new(config: &str) -> Result<Self> {
        let root = TempDir::new()?;
        std::fs::write(root.path().join("ContraGAN.toml"), config)?;
        Ok(Self { root })
    }

    fn cfg_file(&self) -> PathBuf {
        self.root.path().join("ContraGAN.toml")
    }

    fn data_dir(&self) -> PathBuf {
        self.root.path().join("data")
    }

    fn save_dir(&self) -> PathBuf {
        self.root.path().join("runs")
    }

    /// `<data>/CIFAR10/train/<class>/<n>.png`
    fn write_source(&self) -> Result<()> {
        let train = self.data_dir().join("CIFAR10").join("train");
        for class in ["airplane", "automobile"] {
            std::fs::create_dir_all(train.join(class))?;
            for n in 0..3 {
                std::fs::write(train.join(class).join(format!("{n}.png")), format!("{class}-{n}"))?;
            }
        }
        Ok(())
    }

    fn args(&self, flags: &[&str]) -> RunArgs {
        let cfg = self.cfg_file().to_string_lossy().into_owned();
        let data = self.data_dir().to_string_lossy().into_owned();
        let save = self.save_dir().to_string_lossy().into_owned();
        let mut argv = vec![
            "launch".to_string(),
            "-cfg".to_string(),
            cfg,
            "-data".to_string(),
            data,
            "-save".to_string(),
            save,
        ];
        argv.extend(flags.iter().map(|f| f.to_string()));
        Cli::try_parse_args(argv).unwrap().run
    }
}

struct FinishedProcess {
    exit: WorkerExit,
}

#[async_trait]
impl WorkerProcess for FinishedProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> launch_core::Result<WorkerExit> {
        Ok(self.exit.clone())
    }

    async fn kill(&mut self) -> launch_core::Result<()> {
        Ok(())
    }
}

/// Records what each worker was started with
#[derive(Default)]
struct RecordingSpawner {
    spawned: Mutex<Vec<WorkerContext>>,
    exits: HashMap<usize, WorkerExit>,
}

impl RecordingSpawner {
    fn contexts(&self) -> Vec<WorkerContext> {
        self.spawned.lock().unwrap().clone()
    }
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(&self, ctx: &WorkerContext) -> launch_core::Result<Box<dyn WorkerProcess>> {
        self.spawned.lock().unwrap().push(ctx.clone());
        let exit = self
            .exits
            .get(&ctx.local_rank)
            .cloned()
            .unwrap_or(WorkerExit::Success);
        Ok(Box::new(FinishedProcess { exit }))
    }
}

struct NoInlineWorker;

#[async_trait]
impl WorkerEntry for NoInlineWorker {
    async fn run(&self, _ctx: WorkerContext) -> launch_core::Result<()> {
        panic!("inline worker must not run during fan-out");
    }
}

fn build_orchestrator(accelerators: usize, spawner: Arc<RecordingSpawner>) -> Orchestrator {
    Orchestrator::new(
        Arc::new(FixedTopology::new(accelerators, 0)),
        Arc::new(PackedBundleBuilder::new()),
        Arc::new(NoInlineWorker),
        spawner,
    )
}

fn bundle_path(ws: &Workspace) -> PathBuf {
    ws.save_dir()
        .join("data")
        .join("CIFAR10_32_crop_resize32_train.bundle")
}

fn modified(path: &Path) -> Result<std::time::SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

#[tokio::test]
async fn test_cifar10_distributed_training() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    ws.write_source()?;
    let spawner = Arc::new(RecordingSpawner::default());

    let report = build_orchestrator(4, spawner.clone())
        .run(&ws.args(&["-t", "-DDP", "-hdf5", "--seed", "1234"]))
        .await?;

    assert_eq!(report.mode, LaunchMode::FanOut);
    assert_eq!(report.outcomes.len(), 4);

    // Bundle built once, before any worker
    let bundle = bundle_path(&ws);
    let header = PackedBundleBuilder::read_header(&bundle).await?;
    assert_eq!(header.entries.len(), 6);
    assert_eq!(header.num_classes, 2);

    let contexts = spawner.contexts();
    let ranks: Vec<_> = contexts.iter().map(|c| c.local_rank).collect();
    assert_eq!(ranks, vec![0, 1, 2, 3]);

    for ctx in &contexts {
        assert_eq!(ctx.world_size, 4);
        assert_eq!(ctx.dataset.path.as_deref(), Some(bundle.as_path()));
        assert!(ctx.dataset.crop_long_edge);
        assert_eq!(ctx.dataset.resize_size, Some(32));
        assert_eq!(ctx.seed.seed, 1234);
        assert_eq!(ctx.run_name, contexts[0].run_name);
        assert_eq!(ctx.config, contexts[0].config);
    }
    assert!(contexts[0].run_name.starts_with("ContraGAN-train-"));

    // Shared folders exist before the workers start
    for folder in ["checkpoints", "figures", "logs", "moments", "samples", "values"] {
        assert!(ws.save_dir().join(folder).is_dir(), "missing {folder}");
    }
    Ok(())
}

#[tokio::test]
async fn test_pass_through_sections_reach_workers() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    let spawner = Arc::new(RecordingSpawner::default());

    build_orchestrator(2, spawner.clone())
        .run(&ws.args(&["-t", "-DDP"]))
        .await?;

    let config = &spawner.contexts()[1].config;
    assert_eq!(
        config.sections.get("MODEL"),
        Some(&serde_json::json!({
            "backbone": "big_resnet",
            "g_cond_mtd": "cBN",
            "d_cond_mtd": "PD",
        }))
    );
    assert_eq!(
        config.optimization.extra.get("batch_size"),
        Some(&serde_json::json!(64))
    );
    assert_eq!(config.optimization.world_size, 2);
    Ok(())
}

#[tokio::test]
async fn test_second_launch_reuses_bundle() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    ws.write_source()?;

    let first = Arc::new(RecordingSpawner::default());
    build_orchestrator(2, first.clone())
        .run(&ws.args(&["-t", "-DDP", "-hdf5"]))
        .await?;
    let built_at = modified(&bundle_path(&ws))?;

    let second = Arc::new(RecordingSpawner::default());
    build_orchestrator(2, second.clone())
        .run(&ws.args(&["-t", "-DDP", "-hdf5"]))
        .await?;

    assert_eq!(modified(&bundle_path(&ws))?, built_at);
    assert_eq!(
        first.contexts()[0].dataset.path,
        second.contexts()[0].dataset.path
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_dataset_source_stops_before_spawn() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    let spawner = Arc::new(RecordingSpawner::default());

    let result = build_orchestrator(4, spawner.clone())
        .run(&ws.args(&["-t", "-DDP", "-hdf5"]))
        .await;

    assert_eq!(exit_code(&result), 3);
    assert!(spawner.contexts().is_empty());
    assert!(!bundle_path(&ws).exists());
    Ok(())
}

#[tokio::test]
async fn test_all_violations_reported_together() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    let spawner = Arc::new(RecordingSpawner::default());

    let result = build_orchestrator(1, spawner.clone())
        .run(&ws.args(&[
            "-t",
            "-sync_bn",
            "--eval_backbone",
            "VGG16",
            "-l",
        ]))
        .await;

    match result {
        Err(launch_core::Error::Config { violations }) => {
            assert!(violations.iter().any(|v| v.names("RUN.synchronized_bn")));
            assert!(violations.iter().any(|v| v.names("RUN.eval_backbone")));
            assert!(violations.iter().any(|v| v.names("RUN.load_data_in_memory")));
        }
        other => panic!("expected config error, got {other:?}"),
    }
    assert!(spawner.contexts().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_worker_is_reported_after_join() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    let spawner = Arc::new(RecordingSpawner {
        exits: HashMap::from([(2, WorkerExit::Failed { code: Some(1) })]),
        ..Default::default()
    });
    let orchestrator = build_orchestrator(4, spawner.clone());

    let plan = orchestrator.plan(&ws.args(&["-t", "-DDP"])).await?;
    let report = orchestrator.launch(&plan).await?;

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.failed_ranks(), vec![2]);
    assert_eq!(exit_code(&Ok(report)), 4);
    Ok(())
}

#[tokio::test]
async fn test_file_run_values_kept_unless_overridden() -> Result<()> {
    let config = format!("{CIFAR10}\n[RUN]\nseed = 7\nref_dataset = \"valid\"\n");
    let ws = Workspace::new(&config)?;
    let spawner = Arc::new(RecordingSpawner::default());

    build_orchestrator(2, spawner.clone())
        .run(&ws.args(&["-e", "-DDP"]))
        .await?;
    let ctx = &spawner.contexts()[0];
    assert_eq!(ctx.seed.seed, 7);
    assert_eq!(ctx.config.run.ref_dataset, "valid");
    assert!(ctx.run_name.starts_with("ContraGAN-eval-"));

    let spawner = Arc::new(RecordingSpawner::default());
    build_orchestrator(2, spawner.clone())
        .run(&ws.args(&["-e", "-DDP", "--seed", "9"]))
        .await?;
    assert_eq!(spawner.contexts()[0].seed.seed, 9);
    Ok(())
}

#[tokio::test]
async fn test_workers_see_effective_seed_and_preprocessing() -> Result<()> {
    let ws = Workspace::new(CIFAR10)?;
    ws.write_source()?;
    let spawner = Arc::new(RecordingSpawner::default());

    build_orchestrator(2, spawner.clone())
        .run(&ws.args(&["-t", "-DDP", "-hdf5"]))
        .await?;

    for ctx in spawner.contexts() {
        assert_eq!(ctx.config.run.seed, ctx.seed.seed as i64);
        assert_eq!(ctx.config.sections["PRE"]["crop_long_edge"], true);
        assert_eq!(ctx.config.sections["PRE"]["resize_size"], 32);
    }
    Ok(())
}
