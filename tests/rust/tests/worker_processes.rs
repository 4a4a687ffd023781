//! Fan-out with real OS processes
//!
//! Workers are `/bin/sh` scripts started through the re-exec spawner, so
//! these tests exercise the environment contract and process termination.
#![cfg(unix)]

use anyhow::Result;
use async_trait::async_trait;
use launch_core::config::reconcile_str;
use launch_core::{
    select_seed, DatasetCacheHandle, FixedTopology, LaunchPlan, Overrides, TopologyDescriptor,
    WorkerContext,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use worker_pool::{
    FailurePolicy, LaunchMode, ProcessTopologyLauncher, ReexecSpawner, WorkerEntry, WorkerExit,
};

struct Unused;

#[async_trait]
impl WorkerEntry for Unused {
    async fn run(&self, _ctx: WorkerContext) -> launch_core::Result<()> {
        unreachable!("fan-out never runs workers inline")
    }
}

/// Node 1 of 2, three accelerators per node
fn plan() -> Result<LaunchPlan> {
    let config = reconcile_str(
        "[DATA]\nname = \"CIFAR10\"\nimg_size = 32\n",
        Path::new("ContraGAN.toml"),
        &Overrides::new()
            .with("train", true)
            .with("data_dir", "/data")
            .with("distributed_data_parallel", true)
            .with("total_nodes", 2)
            .with("current_node", 1),
        &FixedTopology::new(3, 0),
    )?;
    let topology = TopologyDescriptor::from_config(&config, 0)?;
    Ok(LaunchPlan {
        config: Arc::new(config),
        topology,
        seed: select_seed(5)?,
        run_name: "ContraGAN-train-processes".to_string(),
        dataset: DatasetCacheHandle::uncached(true, Some(32)),
    })
}

fn shell(script: String) -> Arc<ReexecSpawner> {
    Arc::new(ReexecSpawner::new("/bin/sh", vec!["-c".into(), script.into()]))
}

#[tokio::test]
async fn test_workers_receive_rank_environment() -> Result<()> {
    let out = TempDir::new()?;
    let plan = plan()?;
    let script = format!(
        r#"test -n "$LAUNCH_WORKER_CONTEXT" || exit 9; echo "$RANK $WORLD_SIZE $NODE_RANK $PYTHONHASHSEED" > {}/rank_$LOCAL_RANK"#,
        out.path().display()
    );

    let launcher = ProcessTopologyLauncher::new(Arc::new(Unused), shell(script));
    let report = launcher
        .launch(&plan.topology, true, |rank| plan.context(rank))
        .await?;

    assert_eq!(report.mode, LaunchMode::FanOut);
    assert!(report.is_success(), "report: {report:?}");
    for (local, global) in [(0, 3), (1, 4), (2, 5)] {
        let line = std::fs::read_to_string(out.path().join(format!("rank_{local}")))?;
        assert_eq!(line.trim(), format!("{global} 6 1 5"));
    }
    Ok(())
}

#[tokio::test]
async fn test_join_all_collects_every_exit_code() -> Result<()> {
    let plan = plan()?;
    let launcher = ProcessTopologyLauncher::new(
        Arc::new(Unused),
        shell(r#"exit "$LOCAL_RANK""#.to_string()),
    );

    let report = launcher
        .launch(&plan.topology, true, |rank| plan.context(rank))
        .await?;

    let exits: Vec<_> = report.outcomes.iter().map(|o| o.exit.clone()).collect();
    assert_eq!(
        exits,
        vec![
            WorkerExit::Success,
            WorkerExit::Failed { code: Some(1) },
            WorkerExit::Failed { code: Some(2) },
        ]
    );
    assert_eq!(report.failed_ranks(), vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_abort_on_failure_terminates_siblings() -> Result<()> {
    let plan = plan()?;
    let launcher = ProcessTopologyLauncher::new(
        Arc::new(Unused),
        shell(r#"if [ "$LOCAL_RANK" = 0 ]; then exit 1; fi; sleep 30"#.to_string()),
    )
    .with_policy(FailurePolicy::CancelOnFailure);

    let started = Instant::now();
    let report = launcher
        .launch(&plan.topology, true, |rank| plan.context(rank))
        .await?;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(report.outcomes[0].exit, WorkerExit::Failed { code: Some(1) });
    assert_eq!(report.outcomes[1].exit, WorkerExit::Killed);
    assert_eq!(report.outcomes[2].exit, WorkerExit::Killed);
    assert!(launcher.slots().running().is_empty());
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_abort_on_failure_terminates_trainers_started_by_workers() -> Result<()> {
    let out = TempDir::new()?;
    let plan = plan()?;
    // Rank 0 fails once every sibling has started its trainer
    let script = format!(
        r#"if [ "$LOCAL_RANK" = 0 ]; then while [ ! -f {dir}/trainer_1 ] || [ ! -f {dir}/trainer_2 ]; do sleep 0.05; done; exit 1; fi; sleep 30 & echo $! > {dir}/trainer_$LOCAL_RANK.tmp; mv {dir}/trainer_$LOCAL_RANK.tmp {dir}/trainer_$LOCAL_RANK; wait"#,
        dir = out.path().display()
    );
    let launcher = ProcessTopologyLauncher::new(Arc::new(Unused), shell(script))
        .with_policy(FailurePolicy::CancelOnFailure);

    let report = launcher
        .launch(&plan.topology, true, |rank| plan.context(rank))
        .await?;
    assert_eq!(report.outcomes[1].exit, WorkerExit::Killed);

    for rank in [1, 2] {
        let pid: u32 = std::fs::read_to_string(out.path().join(format!("trainer_{rank}")))?
            .trim()
            .parse()?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !exited(pid) {
            assert!(Instant::now() < deadline, "trainer of rank {rank} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    Ok(())
}

/// Gone or a zombie awaiting its new parent
#[cfg(target_os = "linux")]
fn exited(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}
